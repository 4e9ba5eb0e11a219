use async_trait::async_trait;

/// Extra HTTP headers for the upgrade request, in send order
pub type Headers = Vec<(String, String)>;

/// Supplies additional headers for the upgrade request
///
/// Called once per `connect`, so implementations can hand out fresh
/// values (cookies, bearer tokens, an `Origin`) on every new session.
/// Headers the handshake owns (`Host`, `Upgrade`, `Connection` and any
/// `Sec-WebSocket-*`) are ignored if returned here.
///
/// # Example
/// ```ignore
/// struct BearerToken(Arc<RwLock<String>>);
///
/// #[async_trait::async_trait]
/// impl HeaderProvider for BearerToken {
///     async fn get_headers(&self) -> Headers {
///         vec![("Authorization".into(), format!("Bearer {}", self.0.read()))]
///     }
/// }
/// ```
#[async_trait]
pub trait HeaderProvider: Send + Sync {
    /// Headers to append to the next upgrade request
    async fn get_headers(&self) -> Headers;
}

/// A header provider that adds nothing
pub struct NoHeaders;

#[async_trait]
impl HeaderProvider for NoHeaders {
    async fn get_headers(&self) -> Headers {
        Vec::new()
    }
}

/// A fixed set of headers sent on every connect
#[derive(Debug, Clone, Default)]
pub struct StaticHeaders {
    headers: Headers,
}

impl StaticHeaders {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }
}

#[async_trait]
impl HeaderProvider for StaticHeaders {
    async fn get_headers(&self) -> Headers {
        self.headers.clone()
    }
}

/// Whether the handshake reserves this header name for itself
pub(crate) fn is_reserved_header(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    matches!(lower.as_str(), "host" | "upgrade" | "connection")
        || lower.starts_with("sec-websocket-")
}
