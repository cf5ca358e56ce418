//! The heartbeat ticker: one task per manager that fans a server heartbeat
//! out to every adopted session once a second.

use std::sync::{Arc, Mutex, Weak};

use tokio::time::interval;
use tracing::trace;

use crate::config::SERVER_HEARTBEAT_INTERVAL;
use crate::session::Session;

/// Sessions register on adoption and drop out implicitly: an ended session
/// reports an error from its heartbeat and is discarded, as is one whose last
/// strong reference is gone.
pub(crate) struct HeartbeatTicker {
    sessions: Mutex<Vec<Weak<Session>>>,
}

impl HeartbeatTicker {
    pub fn new() -> Arc<HeartbeatTicker> {
        Arc::new(HeartbeatTicker {
            sessions: Mutex::new(Vec::new()),
        })
    }

    pub fn register(&self, session: &Arc<Session>) {
        self.sessions.lock().unwrap().push(Arc::downgrade(session));
    }

    pub async fn run(self: Arc<Self>) {
        let mut tick = interval(SERVER_HEARTBEAT_INTERVAL);
        loop {
            tick.tick().await;
            self.sessions.lock().unwrap().retain(|weak| match weak.upgrade() {
                Some(session) => match session.send_heartbeat() {
                    Ok(()) => true,
                    Err(err) => {
                        trace!("dropping session {} from heartbeat ticks: {}", session.id(), err);
                        false
                    }
                },
                None => false,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SessionOpts;
    use crate::fields::SessionId;

    #[tokio::test(start_paused = true)]
    async fn test_ticker_drops_ended_sessions() {
        let ticker = HeartbeatTicker::new();
        let session = Session::new(
            None,
            None,
            SessionOpts {
                id: SessionId::from_string_trunc("1"),
                ..Default::default()
            },
        );
        ticker.register(&session);
        assert_eq!(ticker.sessions.lock().unwrap().len(), 1);

        let handle = tokio::spawn(ticker.clone().run());

        session.end().unwrap();
        tokio::time::sleep(SERVER_HEARTBEAT_INTERVAL * 3).await;

        assert_eq!(ticker.sessions.lock().unwrap().len(), 0);
        handle.abort();
    }
}
