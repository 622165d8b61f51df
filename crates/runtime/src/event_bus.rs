use tokio::sync::broadcast;

/// Typed event bus with two delivery paths.
///
/// Events are buffered until [`EventBus::drain`] is called (the owner's
/// forwarding loop drains after every operation). Additionally, any live
/// [`EventBus::subscribe`] receivers get a copy immediately.
#[derive(Debug)]
pub struct EventBus<E> {
    pending: Vec<E>,
    live: Option<broadcast::Sender<E>>,
    capacity: usize,
    emitted: u64,
}

impl<E: Clone> EventBus<E> {
    pub fn new(capacity: usize) -> Self {
        Self {
            pending: Vec::new(),
            live: None,
            capacity: capacity.max(1),
            emitted: 0,
        }
    }

    pub fn emit(&mut self, event: E) {
        self.emitted += 1;
        if let Some(tx) = &self.live
            && tx.receiver_count() > 0
        {
            // A send error only means every receiver went away meanwhile.
            let _ = tx.send(event.clone());
        }
        self.pending.push(event);
    }

    pub fn subscribe(&mut self) -> broadcast::Receiver<E> {
        let capacity = self.capacity;
        self.live
            .get_or_insert_with(|| broadcast::channel(capacity).0)
            .subscribe()
    }

    pub fn events(&self) -> &[E] {
        &self.pending
    }

    pub fn drain(&mut self) -> Vec<E> {
        std::mem::take(&mut self.pending)
    }

    /// Total events emitted since creation.
    pub fn emitted(&self) -> u64 {
        self.emitted
    }
}

#[cfg(test)]
mod tests {
    use super::EventBus;

    #[test]
    fn drain_clears_events() {
        let mut bus = EventBus::new(4);
        bus.emit("a");
        bus.emit("b");
        assert_eq!(bus.events(), &["a", "b"]);
        assert_eq!(bus.drain(), vec!["a", "b"]);
        assert!(bus.events().is_empty());
        assert_eq!(bus.emitted(), 2);
    }

    #[test]
    fn subscribers_see_events_emitted_after_subscribing() {
        let mut bus = EventBus::new(4);
        bus.emit(1);
        let mut rx = bus.subscribe();
        bus.emit(2);
        assert_eq!(rx.try_recv().unwrap(), 2);
        assert!(rx.try_recv().is_err());
    }
}
