use tokio::sync::mpsc;

/// A [`mpsc::Receiver`] with a one-slot lookahead.
///
/// The poll encoder needs to know whether the next buffered packet still
/// fits under the maxPayload limit before committing to it; a packet that
/// does not fit stays in the slot for the next polling request.
pub(crate) struct PeekableReceiver<T> {
    rx: mpsc::Receiver<T>,
    next: Option<T>,
}

impl<T> PeekableReceiver<T> {
    pub fn new(rx: mpsc::Receiver<T>) -> Self {
        Self { rx, next: None }
    }

    /// Returns a reference to the next available item without consuming it.
    pub fn try_peek(&mut self) -> Option<&T> {
        if self.next.is_none() {
            self.next = self.rx.try_recv().ok();
        }
        self.next.as_ref()
    }

    /// Consumes the next available item if there is one.
    pub fn try_recv(&mut self) -> Option<T> {
        self.next.take().or_else(|| self.rx.try_recv().ok())
    }

    /// Waits for the next item. Returns `None` when the channel is closed.
    pub async fn recv(&mut self) -> Option<T> {
        match self.next.take() {
            Some(item) => Some(item),
            None => self.rx.recv().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn peek_does_not_consume() {
        let (tx, rx) = mpsc::channel(8);
        let mut rx = PeekableReceiver::new(rx);
        tx.try_send(1).unwrap();
        tx.try_send(2).unwrap();

        assert_eq!(rx.try_peek(), Some(&1));
        assert_eq!(rx.try_peek(), Some(&1));
        assert_eq!(rx.try_recv(), Some(1));
        assert_eq!(rx.recv().await, Some(2));
        assert_eq!(rx.try_recv(), None);
    }
}
