//! Bounded channel bridges between blocking worker threads and the manager
//!
//! The bridge runs its hardware-facing loops (pty reader, port pump) as
//! dedicated blocking threads; the connection manager is a tokio task. They
//! meet over bounded `async_channel` channels: the worker side sends with
//! `send_blocking`, the manager side awaits `recv`. One channel per
//! producer keeps every byte stream FIFO, which is what the ordering
//! guarantee rests on.

use async_channel::{bounded, Receiver, Sender};
use bytes::Bytes;

use crate::device::RequestId;
use crate::{Error, Result};

/// Capacity of every worker-to-manager channel.
pub const CHANNEL_CAPACITY: usize = 256;

/// Events from the per-session I/O pump.
#[derive(Debug, Clone)]
pub enum PumpEvent {
    /// A chunk read from the physical port, in arrival order
    Data {
        /// Session generation the pump was started for
        generation: u64,
        data: Bytes,
    },
    /// The blocking read failed; the pump has exited
    Failed { generation: u64, error: String },
    /// The pump observed its stop flag and exited cleanly
    Stopped { generation: u64 },
}

impl PumpEvent {
    /// Generation of the session this event belongs to.
    pub fn generation(&self) -> u64 {
        match self {
            PumpEvent::Data { generation, .. }
            | PumpEvent::Failed { generation, .. }
            | PumpEvent::Stopped { generation } => *generation,
        }
    }
}

/// Completion of a permission request, delivered by the host platform's
/// broker. Carries the correlation id of the request it answers.
#[derive(Debug, Clone, Copy)]
pub struct PermissionDecision {
    pub request_id: RequestId,
    pub granted: bool,
}

/// Sending half handed to a blocking worker thread (or a broker).
#[derive(Debug, Clone)]
pub struct WorkerTx<T> {
    tx: Sender<T>,
}

impl<T> WorkerTx<T> {
    /// Send from a blocking context; parks the thread when the channel is
    /// full so producers back-pressure instead of dropping.
    pub fn send_blocking(&self, value: T) -> Result<()> {
        self.tx
            .send_blocking(value)
            .map_err(|e| Error::Channel(e.to_string()))
    }

    /// Send without blocking; used by brokers resolving from async or
    /// callback contexts.
    pub fn try_send(&self, value: T) -> Result<()> {
        self.tx
            .try_send(value)
            .map_err(|e| Error::Channel(e.to_string()))
    }

    /// Whether the consuming side has gone away (worker loops use this as
    /// their exit signal).
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Receiving half owned by the manager task.
#[derive(Debug)]
pub struct ControlRx<T> {
    rx: Receiver<T>,
}

impl<T> ControlRx<T> {
    pub async fn recv(&self) -> Result<T> {
        self.rx
            .recv()
            .await
            .map_err(|e| Error::Channel(e.to_string()))
    }

    /// Drain without waiting; used when retiring a session to discard
    /// buffered events from a stopped pump.
    pub fn try_recv(&self) -> Option<T> {
        self.rx.try_recv().ok()
    }
}

/// Create one bounded worker-to-manager bridge.
pub fn create_bridge<T>() -> (WorkerTx<T>, ControlRx<T>) {
    let (tx, rx) = bounded(CHANNEL_CAPACITY);
    (WorkerTx { tx }, ControlRx { rx })
}

#[cfg(test)]
mod tests {
    use super::*;
    use framing::SerialFrame;

    #[tokio::test]
    async fn test_blocking_producer_to_async_consumer() {
        let (tx, rx) = create_bridge::<SerialFrame>();

        // Simulate the pty reader thread
        let handle = std::thread::spawn(move || {
            let frame = SerialFrame::new(true, 250_000, vec![1, 2, 3]);
            tx.send_blocking(frame).unwrap();
        });

        let frame = rx.recv().await.unwrap();
        assert!(frame.start_of_session);
        handle.join().unwrap();
    }

    #[tokio::test]
    async fn test_pump_events_stay_ordered() {
        let (tx, rx) = create_bridge::<PumpEvent>();

        let handle = std::thread::spawn(move || {
            for i in 0..10u8 {
                tx.send_blocking(PumpEvent::Data {
                    generation: 1,
                    data: Bytes::from(vec![i]),
                })
                .unwrap();
            }
            tx.send_blocking(PumpEvent::Stopped { generation: 1 }).unwrap();
        });

        for i in 0..10u8 {
            match rx.recv().await.unwrap() {
                PumpEvent::Data { data, .. } => assert_eq!(data.as_ref(), &[i]),
                other => panic!("unexpected event: {:?}", other),
            }
        }
        assert!(matches!(
            rx.recv().await.unwrap(),
            PumpEvent::Stopped { generation: 1 }
        ));
        handle.join().unwrap();
    }

    #[test]
    fn test_closed_receiver_is_visible_to_worker() {
        let (tx, rx) = create_bridge::<PumpEvent>();
        drop(rx);
        assert!(tx.is_closed());
    }
}
