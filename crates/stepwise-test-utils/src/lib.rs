//! Test doubles for the remote tool backend.
//!
//! [`MockToolProvider`] answers every call by echoing the parameters back
//! with a generated `_id`, the way the blog CRUD server answers `create*`
//! calls. Individual tools can be scripted to fail, to break the transport,
//! or to take time. [`blog_tools`] is the catalog that server advertises.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use futures::future::BoxFuture;
use serde_json::{json, Map, Value};

use stepwise_core::error::{Result, StepwiseError};
use stepwise_core::traits::ToolProvider;
use stepwise_core::types::{ToolDefinition, ToolReply};

#[derive(Debug, Clone)]
enum Behavior {
    Reply(ToolReply),
    TransportError(String),
}

/// Scriptable in-memory [`ToolProvider`].
#[derive(Default)]
pub struct MockToolProvider {
    behaviors: HashMap<String, Behavior>,
    latencies: HashMap<String, Duration>,
    default_latency: Option<Duration>,
    calls: Mutex<Vec<(String, Map<String, Value>)>>,
    next_id: AtomicUsize,
}

impl MockToolProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Always answer `tool` with `reply`.
    pub fn reply(mut self, tool: &str, reply: ToolReply) -> Self {
        self.behaviors.insert(tool.to_string(), Behavior::Reply(reply));
        self
    }

    /// Make calls to `tool` fail before producing a reply.
    pub fn transport_error(mut self, tool: &str, message: &str) -> Self {
        self.behaviors
            .insert(tool.to_string(), Behavior::TransportError(message.to_string()));
        self
    }

    /// Delay replies from `tool`.
    pub fn with_latency(mut self, tool: &str, latency: Duration) -> Self {
        self.latencies.insert(tool.to_string(), latency);
        self
    }

    /// Delay replies from every tool without an explicit latency.
    pub fn with_default_latency(mut self, latency: Duration) -> Self {
        self.default_latency = Some(latency);
        self
    }

    /// Every call received so far, in arrival order.
    pub fn calls(&self) -> Vec<(String, Map<String, Value>)> {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Names of the tools called so far, in arrival order.
    pub fn called_tools(&self) -> Vec<String> {
        self.calls().into_iter().map(|(name, _)| name).collect()
    }

    fn echo(&self, name: &str, parameters: &Map<String, Value>) -> ToolReply {
        let n = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let mut doc = parameters.clone();
        doc.insert("_id".into(), json!(format!("{}-{:04}", name, n)));
        ToolReply::success(format!("{} succeeded", name), Value::Object(doc).to_string())
    }
}

impl ToolProvider for MockToolProvider {
    fn call_tool(
        &self,
        name: &str,
        parameters: Map<String, Value>,
    ) -> BoxFuture<'_, Result<ToolReply>> {
        let name = name.to_string();
        Box::pin(async move {
            self.calls
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push((name.clone(), parameters.clone()));

            if let Some(latency) = self.latencies.get(&name).copied().or(self.default_latency) {
                tokio::time::sleep(latency).await;
            }

            match self.behaviors.get(&name) {
                Some(Behavior::Reply(reply)) => Ok(reply.clone()),
                Some(Behavior::TransportError(message)) => Err(StepwiseError::Mcp(message.clone())),
                None => Ok(self.echo(&name, &parameters)),
            }
        })
    }
}

/// The blog CRUD tool catalog.
pub fn blog_tools() -> Vec<ToolDefinition> {
    let def = |name: &str, description: &str, category: &str, params: &[(&str, bool)]| {
        params.iter().fold(
            ToolDefinition::new(name, description).with_category(category),
            |d, (p, required)| d.with_parameter(*p, "string", *required),
        )
    };

    vec![
        def("createBlog", "Create a new blog post", "blog", &[("title", true), ("content", true), ("authorId", true)]),
        def("getBlog", "Get a blog post by ID", "blog", &[("id", true)]),
        def("updateBlog", "Update a blog post", "blog", &[("id", true), ("title", false), ("content", false)]),
        def("deleteBlog", "Delete a blog post", "blog", &[("id", true)]),
        def("listBlogs", "List all blog posts", "blog", &[]),
        def("createAuthor", "Create a new author", "author", &[("name", true), ("email", true), ("bio", false)]),
        def("getAuthor", "Get an author by ID", "author", &[("id", true)]),
        def("updateAuthor", "Update an author", "author", &[("id", true), ("name", false), ("email", false), ("bio", false)]),
        def("deleteAuthor", "Delete an author", "author", &[("id", true)]),
        def("listAuthors", "List all authors", "author", &[]),
        def("createComment", "Create a comment on a blog post", "comment", &[("blogId", true), ("authorId", true), ("content", true)]),
        def("getComment", "Get a comment by ID", "comment", &[("id", true)]),
        def("deleteComment", "Delete a comment", "comment", &[("id", true)]),
        def("listCommentsByBlog", "List all comments for a blog post", "comment", &[("blogId", true)]),
        def("createPicture", "Create a picture for a blog post", "picture", &[("blogId", true), ("url", true), ("caption", false)]),
        def("getPicture", "Get a picture by ID", "picture", &[("id", true)]),
        def("deletePicture", "Delete a picture", "picture", &[("id", true)]),
        def("listPicturesByBlog", "List all pictures for a blog post", "picture", &[("blogId", true)]),
    ]
}
