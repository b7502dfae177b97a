use std::collections::VecDeque;
use std::sync::Mutex;

/// Minimal thread-safe FIFO used to pump filesystem events from the notify
/// callback into the watch loop.
pub struct FifoQueue<T> {
    inner: Mutex<VecDeque<T>>,
}

impl<T> FifoQueue<T> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(VecDeque::new()),
        }
    }

    pub fn push(&self, value: T) {
        let mut queue = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        queue.push_back(value);
    }

    pub fn pop(&self) -> Option<T> {
        let mut queue = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        queue.pop_front()
    }

    pub fn is_empty(&self) -> bool {
        let queue = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        queue.is_empty()
    }
}

impl<T> Default for FifoQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pops_in_push_order() {
        let queue = FifoQueue::new();
        queue.push(1);
        queue.push(2);
        assert_eq!(queue.pop(), Some(1));
        assert_eq!(queue.pop(), Some(2));
        assert_eq!(queue.pop(), None);
        assert!(queue.is_empty());
    }
}
