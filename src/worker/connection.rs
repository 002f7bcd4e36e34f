//! Worker connection state machine.
//!
//! ```text
//!   Disconnected --begin_connect--> Connecting --registered--> Registered
//!        ^                              |                          |
//!        +---------- disconnected ------+--------------------------+
//! ```
//!
//! Outbound frames are written straight through only while `Registered`.
//! In every other state they join a bounded FIFO queue that is flushed, in
//! order, the moment registration succeeds and before any newer frame.

use std::collections::VecDeque;
use std::time::Duration;

use tokio::sync::mpsc;

use crate::config::BackoffConfig;
use crate::error::Error;
use crate::protocol::WireMessage;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Registered,
    Disconnected,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Connecting => "connecting",
            Self::Registered => "registered",
            Self::Disconnected => "disconnected",
        };
        write!(f, "{s}")
    }
}

/// What happened to a frame handed to [`Connection::send`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Sent,
    Queued,
}

/// Connection bookkeeping owned by one worker client.
#[derive(Debug)]
pub struct Connection {
    state: ConnectionState,
    writer: Option<mpsc::UnboundedSender<WireMessage>>,
    queue: VecDeque<WireMessage>,
    queue_limit: usize,
    backoff: BackoffConfig,
    /// Consecutive failed connection attempts.
    attempt: u32,
}

impl Connection {
    pub fn new(queue_limit: usize, backoff: BackoffConfig) -> Self {
        Self {
            state: ConnectionState::Disconnected,
            writer: None,
            queue: VecDeque::new(),
            queue_limit,
            backoff,
            attempt: 0,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Disconnected → Connecting.
    pub fn begin_connect(&mut self) {
        self.state = ConnectionState::Connecting;
        self.writer = None;
    }

    /// Bind the socket writer for control frames (register, heartbeat)
    /// while registration is still in flight.
    pub fn attach(&mut self, writer: mpsc::UnboundedSender<WireMessage>) {
        self.writer = Some(writer);
    }

    /// Connecting → Registered. Flushes the offline queue in order and
    /// returns how many frames were flushed.
    pub fn registered(&mut self) -> usize {
        let Some(writer) = self.writer.clone() else {
            return 0;
        };

        let mut flushed = 0;
        while let Some(msg) = self.queue.pop_front() {
            if let Err(mpsc::error::SendError(msg)) = writer.send(msg) {
                self.queue.push_front(msg);
                self.state = ConnectionState::Disconnected;
                return flushed;
            }
            flushed += 1;
        }

        self.state = ConnectionState::Registered;
        self.attempt = 0;
        flushed
    }

    /// Any state → Disconnected. Returns the delay before the next attempt.
    pub fn disconnected(&mut self) -> Duration {
        self.state = ConnectionState::Disconnected;
        self.writer = None;
        let delay = self.backoff.delay(self.attempt);
        self.attempt = self.attempt.saturating_add(1);
        delay
    }

    /// Write a control frame if a socket is attached, regardless of
    /// registration. Control frames are never queued.
    pub fn send_control(&self, msg: WireMessage) -> bool {
        match &self.writer {
            Some(writer) => writer.send(msg).is_ok(),
            None => false,
        }
    }

    /// Send a frame, or queue it while not registered.
    pub fn send(&mut self, msg: WireMessage) -> Result<Delivery, Error> {
        let msg = if self.state == ConnectionState::Registered {
            match &self.writer {
                Some(writer) => match writer.send(msg) {
                    Ok(()) => return Ok(Delivery::Sent),
                    Err(mpsc::error::SendError(msg)) => msg,
                },
                None => msg,
            }
        } else {
            msg
        };

        if self.queue.len() >= self.queue_limit {
            return Err(Error::CapacityExceeded {
                what: "outbound queue".to_string(),
                limit: self.queue_limit,
            });
        }
        self.queue.push_back(msg);
        Ok(Delivery::Queued)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn backoff() -> BackoffConfig {
        BackoffConfig {
            base: Duration::from_millis(100),
            max: Duration::from_secs(5),
            jitter: false,
        }
    }

    fn numbered(i: usize) -> WireMessage {
        WireMessage::Message {
            from_agent_id: None,
            content: json!({ "seq": i }),
        }
    }

    #[test]
    fn offline_sends_flush_in_order_after_registration() {
        let mut conn = Connection::new(100, backoff());
        for i in 0..50 {
            assert_eq!(conn.send(numbered(i)).unwrap(), Delivery::Queued);
        }
        assert_eq!(conn.queued(), 50);

        conn.begin_connect();
        let (tx, mut rx) = mpsc::unbounded_channel();
        conn.attach(tx);
        assert!(conn.send_control(WireMessage::register("w1", "r", "coder")));

        // Still connecting: new sends queue behind the backlog.
        assert_eq!(conn.send(numbered(50)).unwrap(), Delivery::Queued);

        assert_eq!(conn.registered(), 51);
        assert_eq!(conn.state(), ConnectionState::Registered);
        assert_eq!(conn.send(numbered(51)).unwrap(), Delivery::Sent);

        assert_eq!(rx.try_recv().unwrap().kind(), "register");
        for i in 0..52 {
            match rx.try_recv().unwrap() {
                WireMessage::Message { content, .. } => assert_eq!(content["seq"], i),
                other => panic!("unexpected frame {other:?}"),
            }
        }
    }

    #[test]
    fn queue_is_bounded_and_keeps_oldest() {
        let mut conn = Connection::new(3, backoff());
        for i in 0..3 {
            conn.send(numbered(i)).unwrap();
        }
        let err = conn.send(numbered(3)).unwrap_err();
        assert!(matches!(err, Error::CapacityExceeded { limit: 3, .. }));
        assert_eq!(conn.queued(), 3);
    }

    #[test]
    fn reconnect_delay_backs_off_and_resets() {
        let mut conn = Connection::new(10, backoff());
        assert_eq!(conn.disconnected(), Duration::from_millis(100));
        assert_eq!(conn.disconnected(), Duration::from_millis(200));
        assert_eq!(conn.disconnected(), Duration::from_millis(400));

        conn.begin_connect();
        let (tx, _rx) = mpsc::unbounded_channel();
        conn.attach(tx);
        conn.registered();
        assert_eq!(conn.attempt(), 0);
        assert_eq!(conn.disconnected(), Duration::from_millis(100));
    }

    #[test]
    fn dead_writer_requeues() {
        let mut conn = Connection::new(10, backoff());
        conn.begin_connect();
        let (tx, rx) = mpsc::unbounded_channel();
        conn.attach(tx);
        conn.registered();
        drop(rx);

        assert_eq!(conn.send(numbered(0)).unwrap(), Delivery::Queued);
        assert_eq!(conn.queued(), 1);
    }

    #[test]
    fn control_frames_need_a_socket() {
        let conn = Connection::new(10, backoff());
        assert!(!conn.send_control(WireMessage::Heartbeat {
            agent_id: "w1".into()
        }));
    }
}
