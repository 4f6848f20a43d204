pub mod daemon;
pub mod file;
pub mod http;
pub mod ssh;

pub use daemon::DaemonTransport;
pub use file::FileTransport;
pub use http::{HttpClient, HttpRequest, HttpResponse, HttpTransport};
pub use ssh::SshTransport;

use crate::error::GitResult;
use crate::pkt::Frame;
use async_trait::async_trait;
use std::fmt::{self, Display, Formatter};
use tokio::io::AsyncBufRead;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Service {
    UploadPack,
    ReceivePack,
}

impl Service {
    pub fn name(self) -> &'static str {
        match self {
            Service::UploadPack => "git-upload-pack",
            Service::ReceivePack => "git-receive-pack",
        }
    }
}

impl Display for Service {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

pub type ResponseStream = Box<dyn AsyncBufRead + Unpin + Send>;

/// A smart-protocol peer. The engine drives every transport through two
/// primitives: capability/ref discovery, then a single request/response
/// exchange per session (the stateless-rpc shape; stateful transports are a
/// trivial superset of it).
#[async_trait]
pub trait SmartTransport: Send {
    /// The server's advertisement for `service`, as raw frames with any
    /// transport-level framing (`# service=` headers) already stripped.
    async fn discover(&mut self, service: Service, protocol_version: u8) -> GitResult<Vec<Frame>>;

    /// Sends one fully-formed request body and hands back the response
    /// stream.
    async fn exchange(
        &mut self,
        service: Service,
        protocol_version: u8,
        request: Vec<u8>,
    ) -> GitResult<ResponseStream>;

    /// Installs credentials after an authentication failure; meaningful
    /// only for transports with an authentication concept.
    fn set_basic_auth(&mut self, _user: &str, _pass: &str) {}
}

/// Progress phases surfaced through `on_progress`.
#[derive(Debug, Clone, PartialEq)]
pub enum Progress {
    Counting { objects: usize },
    ReceivingObjects { bytes: u64 },
    ResolvingDeltas { total: u32 },
    UpdatingWorkingTree,
}

type ProgressFn = Box<dyn FnMut(Progress) + Send>;
type MessageFn = Box<dyn FnMut(&str) + Send>;
type AuthFn = Box<dyn FnMut(&str) -> Option<(String, String)> + Send>;

/// Owned callbacks for the wire engine. Band-2 bytes arrive on
/// `on_message`; observed phases on `on_progress`; `on_auth` may supply
/// credentials once after a 401/403.
#[derive(Default)]
pub struct RemoteCallbacks {
    pub on_progress: Option<ProgressFn>,
    pub on_message: Option<MessageFn>,
    pub on_auth: Option<AuthFn>,
}

impl RemoteCallbacks {
    pub fn progress(&mut self, progress: Progress) {
        if let Some(f) = &mut self.on_progress {
            f(progress);
        }
    }

    pub fn message(&mut self, msg: &str) {
        if let Some(f) = &mut self.on_message {
            f(msg);
        }
    }

    pub fn auth(&mut self, url: &str) -> Option<(String, String)> {
        self.on_auth.as_mut().and_then(|f| f(url))
    }
}

impl std::fmt::Debug for RemoteCallbacks {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteCallbacks")
            .field("on_progress", &self.on_progress.is_some())
            .field("on_message", &self.on_message.is_some())
            .field("on_auth", &self.on_auth.is_some())
            .finish()
    }
}
