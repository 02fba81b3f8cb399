//! The blocking UDP reader feeding the control loop.

use std::net::UdpSocket;
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, trace};

use crate::messages::Message;

const MTU: usize = 2048;

/// Blocking read loop. Decodes datagrams and hands them to the control loop
/// over the bounded packet channel; exits once that channel disconnects.
pub(crate) fn run(
    socket: Arc<UdpSocket>,
    packet_tx: flume::Sender<(Message, std::net::SocketAddr)>,
    rate_limit: i64,
) {
    let mut limiter = RateLimiter::new(rate_limit);
    let mut buf = [0u8; MTU];

    loop {
        match socket.recv_from(&mut buf) {
            Ok((len, from)) => {
                if from.port() == 0 {
                    trace!(?from, "rx ignore (port 0)");
                    continue;
                }

                if !limiter.allow() {
                    trace!(?from, "rx ignore (rate limited)");
                    continue;
                }

                match Message::from_bytes(&buf[..len]) {
                    Ok(message) => {
                        if packet_tx.send((message, from)).is_err() {
                            return;
                        }
                    }
                    Err(error) => {
                        debug!(?error, ?from, "rx ignore (cannot decode)");
                    }
                }
            }

            // The read timeout fired, or the syscall was interrupted. Use
            // the pause to notice shutdown.
            Err(e)
                if matches!(
                    e.kind(),
                    std::io::ErrorKind::WouldBlock
                        | std::io::ErrorKind::TimedOut
                        | std::io::ErrorKind::Interrupted
                ) =>
            {
                if packet_tx.is_disconnected() {
                    return;
                }
            }

            Err(error) => {
                if packet_tx.is_disconnected() {
                    return;
                }
                debug!(?error, "unexpected error while receiving");
            }
        }
    }
}

/// A token bucket admitting `rate` packets per second. A negative rate
/// disables limiting.
struct RateLimiter {
    tokens: f64,
    rate: f64,
    last_update: Instant,
    enabled: bool,
}

impl RateLimiter {
    fn new(rate: i64) -> RateLimiter {
        RateLimiter {
            tokens: rate.max(0) as f64,
            rate: rate.max(0) as f64,
            last_update: Instant::now(),
            enabled: rate >= 0,
        }
    }

    fn allow(&mut self) -> bool {
        if !self.enabled {
            return true;
        }

        let now = Instant::now();
        let elapsed = now.duration_since(self.last_update).as_secs_f64();
        self.last_update = now;

        self.tokens = (self.tokens + elapsed * self.rate).min(self.rate);

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}
