use async_trait::async_trait;
use keyrelay_core::BoxedStream;
use keyrelay_ssh_agent::{AgentSession, SessionError};
use keyrelay_transport::ConnectionHandler;
use tracing::{debug, warn};

/// Serves each accepted connection with an agent protocol session.
#[derive(Debug, Clone)]
pub struct SessionHandler {
    session: AgentSession,
}

impl SessionHandler {
    pub fn new(session: AgentSession) -> Self {
        Self { session }
    }
}

#[async_trait]
impl ConnectionHandler for SessionHandler {
    async fn handle(&self, mut stream: BoxedStream) {
        match self.session.run(&mut stream).await {
            Ok(()) => {}
            Err(SessionError::Io(e)) => debug!(error = %e, "agent connection dropped"),
            Err(e) => warn!(error = %e, "agent session ended with a protocol error"),
        }
    }
}
