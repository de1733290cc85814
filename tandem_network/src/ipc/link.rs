//! Envelope transport over a pair of shared-memory ring queues: one ring
//! per direction, each record one envelope. Priority envelopes ride the
//! ring's priority channel.

use std::time::Duration;

use tandem_runtime::ActionMessage;

use super::IpcRingQueue;
use crate::{Transport, TransportError};

const PUSH_TIMEOUT: Duration = Duration::from_millis(250);
const RECV_SLICE: Duration = Duration::from_millis(10);

/// Config for a shared-memory link: the two rings and the size of the
/// largest record expected on the receive ring (a larger record would never
/// fit the receive buffer and blocks the ring).
pub struct IpcConfig<'a> {
    pub tx_ring: &'a IpcRingQueue<'a>,
    pub rx_ring: &'a IpcRingQueue<'a>,
    pub max_record: usize,
}

/// One direction-paired connection over shared memory.
pub struct IpcConnection<'a> {
    tx_ring: &'a IpcRingQueue<'a>,
    rx_ring: &'a IpcRingQueue<'a>,
    buf: Vec<u8>,
    closed: bool,
}

impl<'a> Transport for IpcConnection<'a> {
    type Config = IpcConfig<'a>;

    fn open(config: IpcConfig<'a>) -> Result<Self, TransportError> {
        Ok(Self {
            tx_ring: config.tx_ring,
            rx_ring: config.rx_ring,
            buf: vec![0; config.max_record],
            closed: false,
        })
    }

    fn send(&self, frame: ActionMessage) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        let bytes = frame.to_bytes();
        let pushed = if frame.is_priority() {
            self.tx_ring.push_priority_timeout(PUSH_TIMEOUT, &bytes)
        } else {
            self.tx_ring.push_timeout(PUSH_TIMEOUT, &bytes)
        };
        if pushed {
            Ok(())
        } else {
            Err(TransportError::Full)
        }
    }

    fn recv(&mut self) -> Result<ActionMessage, TransportError> {
        loop {
            if self.closed {
                return Err(TransportError::Closed);
            }
            // Envelopes are never empty, so 0 means the wait timed out.
            let size = self.rx_ring.pop_timeout(RECV_SLICE, &mut self.buf);
            if size > 0 {
                return Ok(ActionMessage::from_bytes(&self.buf[..size])?);
            }
        }
    }

    fn close(&mut self) -> Result<(), TransportError> {
        self.closed = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tandem_core::Time;
    use tandem_runtime::Action;

    #[test]
    fn envelopes_cross_the_rings() {
        let mut region_ab = vec![0u8; 8192];
        let mut region_ba = vec![0u8; 8192];
        let ring_ab = IpcRingQueue::new(&mut region_ab);
        let ring_ba = IpcRingQueue::new(&mut region_ba);

        let mut a = IpcConnection::open(IpcConfig {
            tx_ring: &ring_ab,
            rx_ring: &ring_ba,
            max_record: 4096,
        })
        .unwrap();
        let mut b = IpcConnection::open(IpcConfig {
            tx_ring: &ring_ba,
            rx_ring: &ring_ab,
            max_record: 4096,
        })
        .unwrap();

        let mut publish = ActionMessage::new(Action::Publish);
        publish.action_time = Time::from_seconds(3.0);
        publish.payload = vec![0, 7, 0, 9];
        a.send(publish.clone()).unwrap();
        assert_eq!(b.recv().unwrap(), publish);

        // A priority envelope overtakes queued data on the ring.
        let mut first = ActionMessage::new(Action::Publish);
        first.payload = b"queued".to_vec();
        a.send(first.clone()).unwrap();
        let mut error = ActionMessage::new(Action::Error);
        error.set_name("out of band");
        a.send(error.clone()).unwrap();
        assert_eq!(b.recv().unwrap(), error);
        assert_eq!(b.recv().unwrap(), first);

        a.close().unwrap();
        assert!(matches!(
            a.send(ActionMessage::new(Action::Ping)),
            Err(TransportError::Closed)
        ));
        b.close().unwrap();
    }
}
