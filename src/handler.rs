//! Message handler - relays allowed Delta Chat messages to the AI provider.
//!
//! One invocation per inbound message event. Every failure is contained
//! here; nothing propagates back into the event loop.

use tracing::{error, info};

use crate::completion;
use crate::config::Config;

/// Apology sent when the completion call or the reply send fails.
pub const ERROR_REPLY: &str =
    "Sorry, I encountered an error processing your message. Please try again later.";

/// Refusal sent to senders outside the allow-list. `sender` is the display
/// form ("Name (addr)").
pub fn refusal_reply(sender: &str) -> String {
    format!("Sorry {sender}, I'm not allowed to talk to you.")
}

/// One inbound message event, as delivered by the transport. Not retained
/// beyond the handling of that event.
#[derive(Debug, Clone)]
pub struct IncomingMessage {
    pub account_id: u32,
    pub chat_id: u32,
    /// Bare e-mail address, matched against the allow-list.
    pub sender_address: String,
    /// Display form used in user-facing replies, e.g. "Alice (alice@example.com)".
    pub sender: String,
    pub text: String,
}

/// The AI side of the relay. `completion::Client` is the real
/// implementation; tests substitute a stub.
pub trait Completion {
    async fn complete(&self, text: &str) -> Result<String, completion::Error>;
}

impl Completion for completion::Client {
    async fn complete(&self, text: &str) -> Result<String, completion::Error> {
        completion::Client::complete(self, text).await
    }
}

/// The messaging side of the relay: one reply-send primitive.
pub trait ChatTransport {
    async fn send_text(
        &mut self,
        account_id: u32,
        chat_id: u32,
        text: &str,
    ) -> Result<(), SendError>;
}

/// Reply-send failure. Logged, never propagated.
#[derive(Debug)]
pub struct SendError(pub String);

impl std::fmt::Display for SendError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "failed to send message: {}", self.0)
    }
}

impl std::error::Error for SendError {}

/// Handle one inbound message event. Sends exactly one reply (refusal,
/// AI reply, or apology) unless that send itself fails, in which case the
/// failure is only logged.
pub async fn handle_message(
    config: &Config,
    ai: &impl Completion,
    transport: &mut impl ChatTransport,
    msg: &IncomingMessage,
) {
    info!("Received message from {} in chat {}", msg.sender, msg.chat_id);

    if !config.is_authorized(&msg.sender_address) {
        let refusal = refusal_reply(&msg.sender);
        if let Err(e) = transport.send_text(msg.account_id, msg.chat_id, &refusal).await {
            error!("Failed to send refusal to {}: {e}", msg.sender);
        }
        return;
    }

    let preview: String = msg.text.chars().take(50).collect();
    info!("Getting AI response for message: {preview}...");

    let outcome = match ai.complete(&msg.text).await {
        Ok(reply) => transport
            .send_text(msg.account_id, msg.chat_id, &reply)
            .await
            .map_err(|e| e.to_string()),
        Err(e) => Err(e.to_string()),
    };

    match outcome {
        Ok(()) => info!("Sent response to {}", msg.sender),
        Err(e) => {
            error!("Error processing message from {}: {e}", msg.sender);
            if let Err(send_error) =
                transport.send_text(msg.account_id, msg.chat_id, ERROR_REPLY).await
            {
                error!("Failed to send error message: {send_error}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::collections::HashMap;

    fn test_config(respond_to: &str) -> Config {
        let vars: HashMap<&str, String> = HashMap::from([
            ("AI_API_KEY", "sk-test".to_string()),
            ("RESPOND_TO", respond_to.to_string()),
        ]);
        Config::from_lookup(|var| vars.get(var).cloned()).expect("test config should load")
    }

    fn message_from(addr: &str, text: &str) -> IncomingMessage {
        IncomingMessage {
            account_id: 1,
            chat_id: 42,
            sender_address: addr.to_string(),
            sender: format!("Tester ({addr})"),
            text: text.to_string(),
        }
    }

    /// Stub completion: canned result, records every prompt it sees.
    struct StubAi {
        result: Result<String, String>,
        calls: RefCell<Vec<String>>,
    }

    impl StubAi {
        fn replying(reply: &str) -> Self {
            Self { result: Ok(reply.to_string()), calls: RefCell::new(Vec::new()) }
        }

        fn failing(error: &str) -> Self {
            Self { result: Err(error.to_string()), calls: RefCell::new(Vec::new()) }
        }
    }

    impl Completion for StubAi {
        async fn complete(&self, text: &str) -> Result<String, completion::Error> {
            self.calls.borrow_mut().push(text.to_string());
            match &self.result {
                Ok(reply) => Ok(reply.clone()),
                Err(e) => Err(completion::Error::Http(e.clone())),
            }
        }
    }

    /// Recording transport; optionally fails the first N sends.
    struct MockTransport {
        sent: Vec<(u32, u32, String)>,
        fail_sends: usize,
    }

    impl MockTransport {
        fn new() -> Self {
            Self { sent: Vec::new(), fail_sends: 0 }
        }

        fn failing(fail_sends: usize) -> Self {
            Self { sent: Vec::new(), fail_sends }
        }
    }

    impl ChatTransport for MockTransport {
        async fn send_text(
            &mut self,
            account_id: u32,
            chat_id: u32,
            text: &str,
        ) -> Result<(), SendError> {
            if self.fail_sends > 0 {
                self.fail_sends -= 1;
                return Err(SendError("connection lost".to_string()));
            }
            self.sent.push((account_id, chat_id, text.to_string()));
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_authorized_sender_gets_ai_reply() {
        let config = test_config("alice@example.com");
        let ai = StubAi::replying("The answer is 4.");
        let mut transport = MockTransport::new();
        let msg = message_from("alice@example.com", "Hello");

        handle_message(&config, &ai, &mut transport, &msg).await;

        assert_eq!(ai.calls.borrow().as_slice(), ["Hello"]);
        assert_eq!(transport.sent, [(1, 42, "The answer is 4.".to_string())]);
    }

    #[tokio::test]
    async fn test_unauthorized_sender_gets_refusal() {
        let config = test_config("alice@example.com");
        let ai = StubAi::replying("should never be asked");
        let mut transport = MockTransport::new();
        let msg = message_from("mallory@example.com", "Hello");

        handle_message(&config, &ai, &mut transport, &msg).await;

        assert!(ai.calls.borrow().is_empty());
        assert_eq!(transport.sent.len(), 1);
        assert_eq!(
            transport.sent[0].2,
            "Sorry Tester (mallory@example.com), I'm not allowed to talk to you."
        );
    }

    #[tokio::test]
    async fn test_empty_allow_list_refuses_everyone() {
        let config = test_config("");
        let ai = StubAi::replying("should never be asked");
        let mut transport = MockTransport::new();
        let msg = message_from("alice@example.com", "Hello");

        handle_message(&config, &ai, &mut transport, &msg).await;

        assert!(ai.calls.borrow().is_empty());
        assert_eq!(transport.sent.len(), 1);
        assert!(transport.sent[0].2.starts_with("Sorry "));
        assert!(transport.sent[0].2.ends_with("I'm not allowed to talk to you."));
    }

    #[tokio::test]
    async fn test_completion_failure_sends_apology() {
        let config = test_config("alice@example.com");
        let ai = StubAi::failing("timed out");
        let mut transport = MockTransport::new();
        let msg = message_from("alice@example.com", "Hello");

        handle_message(&config, &ai, &mut transport, &msg).await;

        assert_eq!(transport.sent, [(1, 42, ERROR_REPLY.to_string())]);
    }

    #[tokio::test]
    async fn test_reply_send_failure_attempts_apology() {
        let config = test_config("alice@example.com");
        let ai = StubAi::replying("Hi!");
        let mut transport = MockTransport::failing(1);
        let msg = message_from("alice@example.com", "Hello");

        handle_message(&config, &ai, &mut transport, &msg).await;

        // The real reply failed; the apology went through.
        assert_eq!(transport.sent, [(1, 42, ERROR_REPLY.to_string())]);
    }

    #[tokio::test]
    async fn test_apology_send_failure_is_swallowed() {
        let config = test_config("alice@example.com");
        let ai = StubAi::failing("boom");
        let mut transport = MockTransport::failing(2);
        let msg = message_from("alice@example.com", "Hello");

        // Must not panic; both sends fail and are only logged.
        handle_message(&config, &ai, &mut transport, &msg).await;

        assert!(transport.sent.is_empty());
    }

    #[tokio::test]
    async fn test_refusal_send_failure_is_swallowed() {
        let config = test_config("");
        let ai = StubAi::replying("unused");
        let mut transport = MockTransport::failing(1);
        let msg = message_from("anyone@example.com", "Hello");

        handle_message(&config, &ai, &mut transport, &msg).await;

        assert!(ai.calls.borrow().is_empty());
        assert!(transport.sent.is_empty());
    }

    #[tokio::test]
    async fn test_exactly_one_completion_call_per_event() {
        let config = test_config("alice@example.com");
        let ai = StubAi::replying("ok");
        let mut transport = MockTransport::new();
        let msg = message_from("alice@example.com", "first");

        handle_message(&config, &ai, &mut transport, &msg).await;
        handle_message(&config, &ai, &mut transport, &msg).await;

        assert_eq!(ai.calls.borrow().len(), 2);
        assert_eq!(transport.sent.len(), 2);
    }
}
