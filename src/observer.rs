//! Synchronous subscriber-list event mechanism.
//!
//! Every cross-layer signal in the stack (a received fragment, a completed
//! transfer, a buffer overrun) is delivered through a [`Subject`]: a list of
//! closures invoked synchronously, in subscription order, on `emit`.
//! Subscribers must not resubscribe to the same subject while it is
//! emitting.

/// A list of subscribers to some event of payload type `T`.
pub struct Subject<T> {
    subscribers: Vec<Box<dyn FnMut(&T)>>,
}

impl<T> Subject<T> {
    /// Creates an empty subject.
    #[must_use]
    pub fn new() -> Self {
        Self {
            subscribers: Vec::new(),
        }
    }

    /// Registers a new subscriber, called on every future `emit`.
    pub fn subscribe(&mut self, f: impl FnMut(&T) + 'static) {
        self.subscribers.push(Box::new(f));
    }

    /// Invokes every subscriber with `value`, in subscription order.
    pub fn emit(&mut self, value: &T) {
        for sub in &mut self.subscribers {
            sub(value);
        }
    }

    /// Number of currently-registered subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }
}

impl<T> Default for Subject<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> std::fmt::Debug for Subject<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subject")
            .field("subscribers", &self.subscribers.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn emits_in_subscription_order() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut subject = Subject::<u32>::new();

        let log1 = log.clone();
        subject.subscribe(move |v| log1.borrow_mut().push(("a", *v)));
        let log2 = log.clone();
        subject.subscribe(move |v| log2.borrow_mut().push(("b", *v)));

        subject.emit(&7);
        subject.emit(&8);

        assert_eq!(
            *log.borrow(),
            vec![("a", 7), ("b", 7), ("a", 8), ("b", 8)]
        );
    }
}
