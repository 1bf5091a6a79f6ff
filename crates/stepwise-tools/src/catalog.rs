use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::OnceCell;
use tracing::{debug, info};

use stepwise_core::error::Result;
use stepwise_core::traits::CatalogSource;
use stepwise_core::types::{ParameterSpec, ToolDefinition};

/// Catalog of available tools. Immutable once built.
#[derive(Debug, Clone, Default)]
pub struct ToolCatalog {
    tools: HashMap<String, ToolDefinition>,
}

impl ToolCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a catalog from definitions. A later duplicate name replaces an earlier one.
    pub fn from_definitions(definitions: impl IntoIterator<Item = ToolDefinition>) -> Self {
        let tools = definitions
            .into_iter()
            .map(|d| (d.name.clone(), d))
            .collect();
        Self { tools }
    }

    /// Get a tool by name.
    pub fn find(&self, name: &str) -> Option<&ToolDefinition> {
        self.tools.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    /// All tools, sorted by name.
    pub fn all(&self) -> Vec<&ToolDefinition> {
        let mut tools: Vec<&ToolDefinition> = self.tools.values().collect();
        tools.sort_by(|a, b| a.name.cmp(&b.name));
        tools
    }

    /// Tools in a category, sorted by name.
    pub fn by_category(&self, category: &str) -> Vec<&ToolDefinition> {
        self.all()
            .into_iter()
            .filter(|t| t.category.as_deref() == Some(category))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

/// A catalog shared by concurrent runs and loaded at most once.
///
/// Callers racing on the first load all wait for the same in-flight load
/// and observe the same catalog. A failed load leaves the cell empty so the
/// next caller retries.
#[derive(Debug, Default)]
pub struct SharedCatalog {
    cell: OnceCell<Arc<ToolCatalog>>,
}

impl SharedCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// A handle that is already loaded.
    pub fn loaded(catalog: ToolCatalog) -> Self {
        Self {
            cell: OnceCell::new_with(Some(Arc::new(catalog))),
        }
    }

    /// The catalog, if loaded.
    pub fn get(&self) -> Option<Arc<ToolCatalog>> {
        self.cell.get().cloned()
    }

    /// Return the catalog, loading it from `source` on first use.
    pub async fn get_or_load(&self, source: &dyn CatalogSource) -> Result<Arc<ToolCatalog>> {
        let catalog = self
            .cell
            .get_or_try_init(|| async {
                let definitions = source.list_tools().await?;
                let catalog = ToolCatalog::from_definitions(definitions);
                info!(tools = catalog.len(), "Tool catalog loaded");
                Ok::<_, stepwise_core::StepwiseError>(Arc::new(catalog))
            })
            .await?;
        Ok(catalog.clone())
    }
}

/// Convert a JSON input schema into per-parameter specs.
///
/// Property types may be written as a bare string (`"title": "string"`) or
/// as a JSON Schema object (`"title": {"type": "string"}`); anything else
/// is recorded as `any`.
pub fn schema_to_parameters(schema: &Value) -> BTreeMap<String, ParameterSpec> {
    let Some(properties) = schema.get("properties").and_then(Value::as_object) else {
        return BTreeMap::new();
    };

    let required: Vec<&str> = schema
        .get("required")
        .and_then(Value::as_array)
        .map(|r| r.iter().filter_map(Value::as_str).collect())
        .unwrap_or_default();

    let params: BTreeMap<String, ParameterSpec> = properties
        .iter()
        .map(|(name, prop)| {
            let kind = match prop {
                Value::String(s) => s.clone(),
                Value::Object(o) => o
                    .get("type")
                    .and_then(Value::as_str)
                    .unwrap_or("any")
                    .to_string(),
                _ => "any".to_string(),
            };
            (
                name.clone(),
                ParameterSpec {
                    kind,
                    required: required.contains(&name.as_str()),
                },
            )
        })
        .collect();

    debug!(count = params.len(), "Converted input schema");
    params
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::future::BoxFuture;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn sample() -> ToolCatalog {
        ToolCatalog::from_definitions(vec![
            ToolDefinition::new("createBlog", "Create a new blog post").with_category("blog"),
            ToolDefinition::new("createAuthor", "Create a new author").with_category("author"),
            ToolDefinition::new("listBlogs", "List all blog posts").with_category("blog"),
        ])
    }

    #[test]
    fn test_find_and_contains() {
        let catalog = sample();
        assert_eq!(catalog.len(), 3);
        assert!(catalog.contains("createAuthor"));
        assert_eq!(
            catalog.find("createBlog").map(|t| t.description.as_str()),
            Some("Create a new blog post")
        );
        assert!(catalog.find("deleteEverything").is_none());
    }

    #[test]
    fn test_all_sorted_and_by_category() {
        let catalog = sample();
        let names: Vec<&str> = catalog.all().iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["createAuthor", "createBlog", "listBlogs"]);
        let blog: Vec<&str> = catalog
            .by_category("blog")
            .iter()
            .map(|t| t.name.as_str())
            .collect();
        assert_eq!(blog, vec!["createBlog", "listBlogs"]);
    }

    #[test]
    fn test_schema_to_parameters_both_forms() {
        let schema = json!({
            "type": "object",
            "properties": {
                "title": "string",
                "authorId": {"type": "string"},
                "meta": true
            },
            "required": ["title", "authorId"]
        });
        let params = schema_to_parameters(&schema);
        assert_eq!(params["title"].kind, "string");
        assert!(params["title"].required);
        assert_eq!(params["authorId"].kind, "string");
        assert_eq!(params["meta"].kind, "any");
        assert!(!params["meta"].required);
    }

    #[test]
    fn test_schema_without_properties() {
        assert!(schema_to_parameters(&json!({"type": "object"})).is_empty());
        assert!(schema_to_parameters(&Value::Null).is_empty());
    }

    struct CountingSource {
        loads: AtomicUsize,
        fail_first: bool,
    }

    impl CatalogSource for CountingSource {
        fn list_tools(&self) -> BoxFuture<'_, Result<Vec<ToolDefinition>>> {
            Box::pin(async move {
                let n = self.loads.fetch_add(1, Ordering::SeqCst);
                tokio::task::yield_now().await;
                if self.fail_first && n == 0 {
                    return Err(stepwise_core::StepwiseError::Catalog("server down".into()));
                }
                Ok(vec![ToolDefinition::new("listBlogs", "List all blog posts")])
            })
        }
    }

    #[tokio::test]
    async fn concurrent_first_load_happens_once() {
        let shared = SharedCatalog::new();
        let source = CountingSource {
            loads: AtomicUsize::new(0),
            fail_first: false,
        };
        let (a, b) = tokio::join!(shared.get_or_load(&source), shared.get_or_load(&source));
        let (a, b) = (a.unwrap(), b.unwrap());
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(source.loads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_load_is_retried() {
        let shared = SharedCatalog::new();
        let source = CountingSource {
            loads: AtomicUsize::new(0),
            fail_first: true,
        };
        assert!(shared.get_or_load(&source).await.is_err());
        assert!(shared.get().is_none());
        let catalog = shared.get_or_load(&source).await.unwrap();
        assert!(catalog.contains("listBlogs"));
    }

    #[test]
    fn test_preloaded() {
        let shared = SharedCatalog::loaded(sample());
        assert_eq!(shared.get().unwrap().len(), 3);
    }
}
