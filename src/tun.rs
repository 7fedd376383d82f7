//! Packet-level handle to the local virtual interface.
//!
//! The OS-specific TUN driver lives outside this crate. It gets one end of
//! a [`TunHandle`] pair and pumps raw IP packets between the device and the
//! channel; the transport manager owns the other end. No link-layer header
//! crosses this boundary; on platforms that need one, the driver
//! injects/strips it.

use tokio::sync::mpsc;

/// One end of a virtual-interface packet channel.
pub struct TunHandle {
    name: String,
    tx: mpsc::Sender<Vec<u8>>,
    rx: mpsc::Receiver<Vec<u8>>,
}

/// Default per-direction packet capacity.
pub const DEFAULT_CAPACITY: usize = 256;

impl TunHandle {
    /// Create a connected pair: one end for the transport manager, one for
    /// the platform driver.
    pub fn pair(name: impl Into<String>, capacity: usize) -> (TunHandle, TunHandle) {
        let name = name.into();
        let (a_tx, b_rx) = mpsc::channel(capacity);
        let (b_tx, a_rx) = mpsc::channel(capacity);
        (
            TunHandle {
                name: name.clone(),
                tx: a_tx,
                rx: a_rx,
            },
            TunHandle {
                name,
                tx: b_tx,
                rx: b_rx,
            },
        )
    }

    /// Interface name, exported to the helper as `TUNDEV`.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Receive the next packet from the other end. `None` when the peer is
    /// gone. Cancel-safe.
    pub async fn recv(&mut self) -> Option<Vec<u8>> {
        self.rx.recv().await
    }

    /// Non-blocking receive, used to drain the per-source budget.
    pub fn try_recv(&mut self) -> Option<Vec<u8>> {
        self.rx.try_recv().ok()
    }

    /// Send a packet toward the other end, waiting for queue space.
    pub async fn send(&self, pkt: Vec<u8>) -> bool {
        self.tx.send(pkt).await.is_ok()
    }

    /// Non-blocking send. `false` when the queue is full or the peer is
    /// gone; the caller decides whether the packet may be dropped.
    pub fn try_send(&self, pkt: Vec<u8>) -> bool {
        self.tx.try_send(pkt).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn packets_cross_the_pair_both_ways() {
        let (mut core, mut driver) = TunHandle::pair("tun0", 8);
        assert_eq!(core.name(), "tun0");

        assert!(driver.send(vec![0x45, 0x00]).await);
        assert_eq!(core.recv().await, Some(vec![0x45, 0x00]));

        assert!(core.try_send(vec![0x60, 0x00]));
        assert_eq!(driver.recv().await, Some(vec![0x60, 0x00]));
    }

    #[tokio::test]
    async fn full_queue_refuses_try_send() {
        let (core, mut driver) = TunHandle::pair("tun0", 1);
        assert!(core.try_send(vec![1]));
        assert!(!core.try_send(vec![2]));
        assert_eq!(driver.recv().await, Some(vec![1]));
        assert!(core.try_send(vec![3]));
    }

    #[tokio::test]
    async fn dropped_peer_ends_the_stream() {
        let (mut core, driver) = TunHandle::pair("tun0", 1);
        drop(driver);
        assert_eq!(core.recv().await, None);
        assert!(!core.try_send(vec![1]));
    }
}
