//! Getting the interpreter into (and back out of) a known state.

use std::collections::VecDeque;
use std::time::Duration;

use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::ReplError;
use crate::protocol::{
    COMMAND_PROMPT, CONNECT_BANNER, CONSOLE_BANNER, DETACH, INTERRUPT, RESUME_COMMAND,
    RUNNING_BANNER,
};
use crate::session::{Pattern, Session};

pub const MIN_TOKEN_LEN: usize = 8;

/// Supplies the marker printed during [`Synchronizer::sync`].
pub trait TokenSource: Send {
    fn next_token(&mut self) -> String;
}

/// Fresh random tokens of [`MIN_TOKEN_LEN`] upper-case hex digits.
#[derive(Debug, Default, Clone, Copy)]
pub struct RandomTokens;

impl TokenSource for RandomTokens {
    fn next_token(&mut self) -> String {
        let mut token = Uuid::new_v4().simple().to_string().to_uppercase();
        token.truncate(MIN_TOKEN_LEN);
        token
    }
}

/// Hands out a fixed list of tokens in rotation.
#[derive(Debug, Clone)]
pub struct FixedTokens {
    tokens: VecDeque<String>,
}

impl FixedTokens {
    pub fn new<I, S>(tokens: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            tokens: tokens.into_iter().map(Into::into).collect(),
        }
    }
}

impl TokenSource for FixedTokens {
    fn next_token(&mut self) -> String {
        match self.tokens.pop_front() {
            Some(token) => {
                self.tokens.push_back(token.clone());
                token
            }
            None => String::new(),
        }
    }
}

fn check_token(token: &str) -> Result<(), ReplError> {
    if token.len() < MIN_TOKEN_LEN || !token.chars().all(|c| c.is_ascii_alphanumeric()) {
        return Err(ReplError::Config(format!(
            "sync token {token:?} must be at least {MIN_TOKEN_LEN} ascii alphanumerics"
        )));
    }
    Ok(())
}

/// Turn a timeout into a desync; everything else passes through.
fn desync(stage: &'static str) -> impl FnOnce(ReplError) -> ReplError {
    move |e| match e {
        ReplError::Timeout { expected, .. } => {
            warn!(stage, expected = %expected, "sync failed");
            ReplError::Desync(format!("{stage}: no {expected:?} from the interpreter"))
        }
        other => other,
    }
}

pub struct Synchronizer {
    tokens: Box<dyn TokenSource>,
    timeout: Duration,
}

impl Synchronizer {
    pub fn new(tokens: Box<dyn TokenSource>, timeout: Duration) -> Self {
        Self { tokens, timeout }
    }

    /// Wait for the transport bridge to report that the link is up.
    pub fn await_banner(&self, session: &mut Session, timeout: Duration) -> Result<(), ReplError> {
        session.expect_within(CONNECT_BANNER, timeout)?;
        session.expect_within(CONSOLE_BANNER, timeout)?;
        debug!("transport banner seen");
        Ok(())
    }

    /// Stop whatever is running and confirm that the next prompt is ours.
    ///
    /// A bare prompt match could come from stale output, so a freshly
    /// generated token is printed and the prompt is only trusted once it
    /// follows the token.
    pub fn sync(&mut self, session: &mut Session) -> Result<(), ReplError> {
        let was_muted = session.set_muted(true);
        let result = self.sync_inner(session);
        session.set_muted(was_muted);
        result
    }

    fn sync_inner(&mut self, session: &mut Session) -> Result<(), ReplError> {
        let token = self.tokens.next_token();
        check_token(&token)?;

        session.send(&[INTERRUPT])?;
        session
            .expect_within(COMMAND_PROMPT, self.timeout)
            .map_err(desync("interrupt"))?;

        // Split so the echoed command never contains the token itself.
        let (head, tail) = token.split_at(token.len() / 2);
        session.send_line(&format!("print(\"{head}\"\"{tail}\")"))?;
        session
            .expect_within(Pattern::from(token.as_str()), self.timeout)
            .map_err(desync("token"))?;
        session
            .expect_within(COMMAND_PROMPT, self.timeout)
            .map_err(desync("prompt"))?;

        info!("synchronised with interpreter");
        Ok(())
    }

    /// Restart the foreground task and let go of the console.
    pub fn unsync(&self, session: &mut Session) -> Result<(), ReplError> {
        session.send_line(RESUME_COMMAND)?;
        session.expect(RUNNING_BANNER)?;
        session.send(&[DETACH])?;
        info!("interpreter released");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::SimulatedWatch;

    fn session_for(watch: &SimulatedWatch) -> Session {
        Session::new(Box::new(watch.link()))
    }

    #[test]
    fn random_tokens_are_fresh_and_valid() {
        let mut tokens = RandomTokens;
        let a = tokens.next_token();
        let b = tokens.next_token();
        assert_ne!(a, b);
        check_token(&a).unwrap();
        assert_eq!(a.len(), MIN_TOKEN_LEN);
    }

    #[test]
    fn fixed_tokens_rotate() {
        let mut tokens = FixedTokens::new(["AAAAAAAA", "BBBBBBBB"]);
        assert_eq!(tokens.next_token(), "AAAAAAAA");
        assert_eq!(tokens.next_token(), "BBBBBBBB");
        assert_eq!(tokens.next_token(), "AAAAAAAA");
    }

    #[test]
    fn short_token_is_rejected() {
        let watch = SimulatedWatch::silent();
        let mut session = session_for(&watch);
        let mut sync = Synchronizer::new(
            Box::new(FixedTokens::new(["ABC"])),
            Duration::from_millis(200),
        );
        assert!(matches!(sync.sync(&mut session), Err(ReplError::Config(_))));
    }

    #[test]
    fn sync_from_running_device() {
        let watch = SimulatedWatch::new();
        let mut session = session_for(&watch);
        let mut sync = Synchronizer::new(
            Box::new(FixedTokens::new(["QWERTYUI"])),
            Duration::from_secs(2),
        );
        sync.await_banner(&mut session, Duration::from_secs(2))
            .unwrap();
        sync.sync(&mut session).unwrap();
        assert!(!watch.is_running());
        assert_eq!(watch.commands(), vec!["print(\"QWER\"\"TYUI\")".to_string()]);
        assert_eq!(session.drain_pending(), "");
    }

    #[derive(Clone, Default)]
    struct Sink(std::sync::Arc<std::sync::Mutex<Vec<u8>>>);

    impl std::io::Write for Sink {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn sync_traffic_stays_off_the_mirror() {
        let watch = SimulatedWatch::silent();
        let sink = Sink::default();
        let mut session = session_for(&watch).with_mirror(Box::new(sink.clone()));
        let mut sync = Synchronizer::new(
            Box::new(FixedTokens::new(["MNBVCXZL"])),
            Duration::from_secs(2),
        );
        sync.sync(&mut session).unwrap();
        assert!(sink.0.lock().unwrap().is_empty());

        // The mirror is live again once sync is done.
        session.send_line("print(\"after\")").unwrap();
        session.expect("after\r\n").unwrap();
        let seen = String::from_utf8(sink.0.lock().unwrap().clone()).unwrap();
        assert!(seen.contains("after"), "{seen:?}");
    }

    #[test]
    fn unsync_resumes_and_detaches() {
        let watch = SimulatedWatch::silent();
        let mut session = session_for(&watch);
        let mut sync = Synchronizer::new(Box::new(RandomTokens), Duration::from_secs(2));
        sync.sync(&mut session).unwrap();
        sync.unsync(&mut session).unwrap();
        assert!(watch.is_running());
        assert!(watch.is_detached());
    }

    #[test]
    fn missing_banner_times_out() {
        let watch = SimulatedWatch::silent();
        let mut session = session_for(&watch);
        let sync = Synchronizer::new(Box::new(RandomTokens), Duration::from_secs(1));
        let err = sync
            .await_banner(&mut session, Duration::from_millis(50))
            .unwrap_err();
        assert!(matches!(err, ReplError::Timeout { .. }));
    }
}
