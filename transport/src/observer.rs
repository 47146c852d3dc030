#[cfg(test)] use mockall::automock;
use crate::connection::ConnectionHandle;
use crate::tick::Tick;

/// Optional hook for applications that prefer being notified over polling `receive`. Messages
///  are queued for `receive` / `peek` regardless.
///
/// NB: The observer is called while the registry is busy, so it must neither block nor call
///  back into the registry.
#[cfg_attr(test, automock)]
pub trait ConnectionObserver: Send + Sync + 'static {
    /// a message was queued in the connection's receive ring
    fn on_delivered(&self, conn: ConnectionHandle, data: &[u8], when: Tick);

    /// a reliable record went out as forward content of a datagram, which happens again when a
    ///  NAK rewinds the send ring
    fn on_transmitted(&self, conn: ConnectionHandle, data: &[u8], now: Tick);
}
