//! Response delivery
//!
//! Observers are invoked from the task that produced the response, after the
//! ledger lock has been released. They must not block.

use crate::protocol::Response;
use tokio::sync::mpsc;

pub trait ResponseObserver: Send + Sync {
    fn on_response(&self, response: &Response);
}

impl<F> ResponseObserver for F
where
    F: Fn(&Response) + Send + Sync,
{
    fn on_response(&self, response: &Response) {
        self(response)
    }
}

/// Forwards every response into an unbounded channel.
pub struct ChannelObserver {
    tx: mpsc::UnboundedSender<Response>,
}

impl ChannelObserver {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Response>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (ChannelObserver { tx }, rx)
    }
}

impl ResponseObserver for ChannelObserver {
    fn on_response(&self, response: &Response) {
        // Receiver gone means nobody is listening any more
        let _ = self.tx.send(response.clone());
    }
}
