//! MQTT ingress routing.
//!
//! Tokenises inbound topics under the configured prefix into a static
//! [`Topic`] plus trailing segments, applies the authorisation policy, and
//! dispatches to the registered handlers in registration order until one
//! returns `true`. Unhandled messages are logged and dropped.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use log::{debug, warn};

/// First-level topic table. Everything the bridge listens to lives under
/// one of these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    Digital,
    Analog,
    File,
    Datastore,
    Mailbox,
    Console,
    System,
    Shell,
}

impl Topic {
    pub fn from_token(token: &str) -> Option<Topic> {
        match token {
            "d" => Some(Topic::Digital),
            "a" => Some(Topic::Analog),
            "file" => Some(Topic::File),
            "datastore" => Some(Topic::Datastore),
            "mailbox" => Some(Topic::Mailbox),
            "console" => Some(Topic::Console),
            "system" => Some(Topic::System),
            "sh" => Some(Topic::Shell),
            _ => None,
        }
    }
}

/// Actions the authorisation policy can deny.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    PinWrite,
    PinRead,
    PinMode,
    ConsoleInput,
    DatastorePut,
    DatastoreGet,
    FileWrite,
    FileRead,
    FileRemove,
    MailboxWrite,
    ShellRun,
    ShellKill,
    SystemCommand,
}

impl Action {
    pub const ALL: &'static [Action] = &[
        Action::PinWrite,
        Action::PinRead,
        Action::PinMode,
        Action::ConsoleInput,
        Action::DatastorePut,
        Action::DatastoreGet,
        Action::FileWrite,
        Action::FileRead,
        Action::FileRemove,
        Action::MailboxWrite,
        Action::ShellRun,
        Action::ShellKill,
        Action::SystemCommand,
    ];

    pub fn from_name(name: &str) -> Option<Action> {
        Self::ALL.iter().copied().find(|a| a.name() == name)
    }

    /// Config-facing name, e.g. `file_write`.
    pub fn name(self) -> &'static str {
        match self {
            Action::PinWrite => "pin_write",
            Action::PinRead => "pin_read",
            Action::PinMode => "pin_mode",
            Action::ConsoleInput => "console_input",
            Action::DatastorePut => "datastore_put",
            Action::DatastoreGet => "datastore_get",
            Action::FileWrite => "file_write",
            Action::FileRead => "file_read",
            Action::FileRemove => "file_remove",
            Action::MailboxWrite => "mailbox_write",
            Action::ShellRun => "shell_run",
            Action::ShellKill => "shell_kill",
            Action::SystemCommand => "system_command",
        }
    }
}

/// Per-action allow/deny policy. Default allows every tracked action.
#[derive(Debug, Default, Clone)]
pub struct TopicAuthorization {
    denied: HashSet<Action>,
}

impl TopicAuthorization {
    pub fn allow_all() -> Self {
        Self::default()
    }

    /// Build from the configured denial list; unknown names are logged
    /// and ignored.
    pub fn from_names(names: &[String]) -> Self {
        let mut policy = Self::default();
        for name in names {
            match Action::from_name(name) {
                Some(action) => {
                    policy.denied.insert(action);
                }
                None => warn!("policy: unknown denied action '{name}'"),
            }
        }
        policy
    }

    pub fn deny(mut self, action: Action) -> Self {
        self.denied.insert(action);
        self
    }

    pub fn allows(&self, _topic: Topic, action: Action) -> bool {
        !self.denied.contains(&action)
    }
}

/// Tokenised route: the table entry plus the segments after it.
#[derive(Debug, Clone)]
pub struct RouteMatch {
    pub topic: Topic,
    pub segments: Vec<String>,
}

impl RouteMatch {
    pub fn segment(&self, index: usize) -> Option<&str> {
        self.segments.get(index).map(String::as_str)
    }

    /// Remaining segments from `index` joined back into a path.
    pub fn tail(&self, index: usize) -> String {
        self.segments[index.min(self.segments.len())..].join("/")
    }
}

/// One inbound MQTT message, detached from the client types.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub response_topic: Option<String>,
    pub correlation: Option<Vec<u8>>,
}

impl InboundMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            response_topic: None,
            correlation: None,
        }
    }

    pub fn payload_str(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.payload)
    }
}

/// Uniform handler signature: `(route, message) -> handled`.
#[async_trait]
pub trait TopicHandler: Send + Sync {
    async fn handle(&self, route: &RouteMatch, message: &InboundMessage) -> bool;
}

/// Registration-order multi-handler dispatch.
pub struct IngressRouter {
    prefix: String,
    handlers: Vec<(Topic, Arc<dyn TopicHandler>)>,
}

impl IngressRouter {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            handlers: Vec::new(),
        }
    }

    pub fn register(&mut self, topic: Topic, handler: Arc<dyn TopicHandler>) {
        self.handlers.push((topic, handler));
    }

    /// Strip the prefix and tokenise. `None` for foreign or bare topics.
    pub fn tokenize(&self, full_topic: &str) -> Option<RouteMatch> {
        let rest = full_topic.strip_prefix(&self.prefix)?.strip_prefix('/')?;
        let mut parts = rest.split('/').filter(|s| !s.is_empty());
        let topic = Topic::from_token(parts.next()?)?;
        Some(RouteMatch {
            topic,
            segments: parts.map(str::to_string).collect(),
        })
    }

    /// Route one message. Returns whether any handler consumed it.
    pub async fn dispatch(&self, message: &InboundMessage) -> bool {
        let Some(route) = self.tokenize(&message.topic) else {
            debug!("router: no route for {}", message.topic);
            return false;
        };

        for (topic, handler) in &self.handlers {
            if *topic == route.topic && handler.handle(&route, message).await {
                return true;
            }
        }

        warn!("router: unhandled topic {}", message.topic);
        false
    }
}

// ── Tests ────────────────────────────────────────────────────
