use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio_util::sync::CancellationToken;

use stepwise_core::config::EngineConfig;
use stepwise_core::types::{ExecutionEvent, ExecutionMode, ExecutionStatus, PlanState, Step, ToolReply};
use stepwise_core::EventBus;
use stepwise_engine::{execution_order, sort_steps, EngineError, ExecutionEngine, RunRequest};
use stepwise_test_utils::{blog_tools, MockToolProvider};
use stepwise_tools::{ToolCatalog, ToolInvoker};

fn engine_with(provider: Arc<MockToolProvider>) -> ExecutionEngine {
    let catalog = Arc::new(ToolCatalog::from_definitions(blog_tools()));
    ExecutionEngine::new(ToolInvoker::new(catalog, provider))
}

fn create_author() -> Step {
    Step::new("createAuthor")
        .with_param("name", "Bob")
        .with_param("email", "bob@x.com")
}

fn create_blog() -> Step {
    Step::new("createBlog")
        .after("createAuthor")
        .with_param("authorId", "{{createAuthor._id}}")
        .with_param("title", "T")
        .with_param("content", "C")
}

#[tokio::test]
async fn single_step_chained_records_output() {
    let provider = Arc::new(MockToolProvider::new());
    let engine = engine_with(provider.clone());

    let request = RunRequest::new("Create an author", vec![create_author()])
        .with_mode(ExecutionMode::Chained);
    let result = engine.invoke(request).await.unwrap();

    assert_eq!(result.results.successful, 1);
    assert_eq!(result.results.failed, 0);
    assert_eq!(result.state(), PlanState::Completed);

    let outputs = result.previous_outputs.as_ref().unwrap();
    let author = &outputs["createAuthor"];
    assert_eq!(author["_id"], "createAuthor-0001");
    assert_eq!(author["name"], "Bob");
    assert_eq!(author["email"], "bob@x.com");
}

#[tokio::test]
async fn chained_reference_resolves_to_real_id() {
    let provider = Arc::new(MockToolProvider::new());
    let engine = engine_with(provider.clone());

    let steps = vec![create_blog(), create_author()];
    let order = execution_order(&steps);
    assert_eq!(order, vec!["createAuthor", "createBlog"]);

    let request = RunRequest::new("Author then blog", sort_steps(&steps, &order)).with_order(order);
    let result = engine.invoke(request).await.unwrap();

    assert_eq!(result.mode, ExecutionMode::Chained);
    assert_eq!(result.results.successful, 2);

    let calls = provider.calls();
    assert_eq!(calls[1].0, "createBlog");
    assert_eq!(calls[1].1["authorId"], json!("createAuthor-0001"));

    let blog = result.output_of("createBlog").unwrap();
    assert_eq!(blog["authorId"], "createAuthor-0001");
}

#[tokio::test]
async fn unknown_tool_yields_one_error_line() {
    let provider = Arc::new(MockToolProvider::new());
    let engine = engine_with(provider.clone());

    let request = RunRequest::new("p", vec![Step::new("listBlogs"), Step::new("summonDragon")]);
    let result = engine.invoke(request).await.unwrap();

    assert_eq!(result.errors, vec!["summonDragon: Tool \"summonDragon\" not found"]);
    assert!(result.output_of("summonDragon").is_none());
    assert!(result.output_of("listBlogs").is_some());
    assert_eq!(provider.called_tools(), vec!["listBlogs"]);
    assert_eq!(result.state(), PlanState::Failed);
}

#[tokio::test]
async fn failed_dependency_leaves_reference_unresolved() {
    let provider = Arc::new(
        MockToolProvider::new().reply("createAuthor", ToolReply::failure("Email already registered")),
    );
    let engine = engine_with(provider.clone());

    let result = engine.run_plan("Author then blog", vec![create_author(), create_blog()]).await.unwrap();

    assert_eq!(result.results.failed, 1);
    assert_eq!(result.results.successful, 1);
    assert_eq!(result.errors, vec!["createAuthor: Email already registered"]);

    let calls = provider.calls();
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[1].1["authorId"], json!("{{createAuthor._id}}"));

    let blog = &result.executions[1];
    assert_eq!(blog.status, ExecutionStatus::Completed);
    assert!(blog.parameters["authorId"].is_reference());
    assert!(!result.previous_outputs.unwrap().contains_key("createAuthor"));
}

#[tokio::test]
async fn parallel_mode_sends_templates_as_written() {
    let provider = Arc::new(MockToolProvider::new());
    let engine = engine_with(provider.clone());

    let request = RunRequest::new("p", vec![create_author(), create_blog()])
        .with_mode(ExecutionMode::Parallel);
    let result = engine.invoke(request).await.unwrap();

    assert!(result.previous_outputs.is_none());
    let blog_call = provider
        .calls()
        .into_iter()
        .find(|(name, _)| name == "createBlog")
        .unwrap();
    assert_eq!(blog_call.1["authorId"], json!("{{createAuthor._id}}"));
}

#[tokio::test(start_paused = true)]
async fn parallel_steps_overlap() {
    let provider = Arc::new(MockToolProvider::new().with_default_latency(Duration::from_secs(1)));
    let engine = engine_with(provider);

    let steps = vec![
        Step::new("listBlogs"),
        Step::new("listAuthors"),
        Step::new("getBlog").with_param("id", "b1"),
        Step::new("getAuthor").with_param("id", "a1"),
        Step::new("getPicture").with_param("id", "p1"),
    ];
    let started = tokio::time::Instant::now();
    let result = engine.invoke(RunRequest::new("p", steps)).await.unwrap();
    let elapsed = started.elapsed();

    assert_eq!(result.mode, ExecutionMode::Parallel);
    assert_eq!(result.results.successful, 5);
    assert!(elapsed >= Duration::from_secs(1));
    assert!(elapsed < Duration::from_secs(2), "took {:?}", elapsed);
}

#[tokio::test(start_paused = true)]
async fn chained_steps_run_one_after_another() {
    let provider = Arc::new(MockToolProvider::new().with_default_latency(Duration::from_secs(1)));
    let engine = engine_with(provider);

    let steps = vec![Step::new("listBlogs"), Step::new("listAuthors"), Step::new("listPicturesByBlog")];
    let started = tokio::time::Instant::now();
    let result = engine
        .invoke(RunRequest::new("p", steps).with_mode(ExecutionMode::Chained))
        .await
        .unwrap();

    assert_eq!(result.results.successful, 3);
    assert!(started.elapsed() >= Duration::from_secs(3));
}

#[tokio::test(start_paused = true)]
async fn concurrency_cap_limits_fan_out_and_keeps_order() {
    let provider = Arc::new(MockToolProvider::new().with_default_latency(Duration::from_secs(1)));
    let engine = engine_with(provider).with_max_concurrency(Some(2));

    let names = ["listBlogs", "listAuthors", "getBlog", "getAuthor"];
    let steps: Vec<Step> = names.iter().map(|n| Step::new(*n)).collect();
    let started = tokio::time::Instant::now();
    let result = engine.invoke(RunRequest::new("p", steps)).await.unwrap();
    let elapsed = started.elapsed();

    assert!(elapsed >= Duration::from_secs(2));
    assert!(elapsed < Duration::from_secs(3), "took {:?}", elapsed);
    let order: Vec<&str> = result.executions.iter().map(|r| r.tool_name.as_str()).collect();
    assert_eq!(order, names);
}

#[tokio::test(start_paused = true)]
async fn step_timeout_fails_only_that_step() {
    let provider = Arc::new(MockToolProvider::new().with_latency("getBlog", Duration::from_secs(10)));
    let catalog = Arc::new(ToolCatalog::from_definitions(blog_tools()));
    let config = EngineConfig {
        step_timeout_secs: 2,
        ..EngineConfig::default()
    };
    let engine = ExecutionEngine::from_config(ToolInvoker::new(catalog, provider), &config);

    let steps = vec![Step::new("getBlog").with_param("id", "b1"), Step::new("listBlogs")];
    let result = engine.invoke(RunRequest::new("p", steps)).await.unwrap();

    assert_eq!(result.errors, vec!["getBlog: Tool \"getBlog\" timed out after 2s"]);
    assert_eq!(result.results.successful, 1);
}

#[tokio::test(start_paused = true)]
async fn cancellation_stops_the_chain() {
    let provider = Arc::new(MockToolProvider::new().with_default_latency(Duration::from_secs(1)));
    let engine = engine_with(provider.clone());
    let cancel = CancellationToken::new();

    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(1500)).await;
        trigger.cancel();
    });

    let steps = vec![Step::new("listBlogs"), Step::new("listAuthors"), Step::new("listPicturesByBlog")];
    let result = engine
        .invoke_with_cancel(RunRequest::new("p", steps).with_mode(ExecutionMode::Chained), cancel)
        .await
        .unwrap();

    let statuses: Vec<ExecutionStatus> = result.executions.iter().map(|r| r.status).collect();
    assert_eq!(
        statuses,
        vec![ExecutionStatus::Completed, ExecutionStatus::Error, ExecutionStatus::Error]
    );
    assert_eq!(
        result.errors,
        vec!["listAuthors: cancelled", "listPicturesByBlog: cancelled"]
    );
    assert_eq!(provider.called_tools(), vec!["listBlogs", "listAuthors"]);
}

#[tokio::test]
async fn counts_always_add_up() {
    let provider = Arc::new(
        MockToolProvider::new()
            .reply("getBlog", ToolReply::failure("Blog not found"))
            .transport_error("getAuthor", "connection reset")
            .reply("listBlogs", ToolReply::success("ok", "not json")),
    );
    let engine = engine_with(provider);

    let steps = vec![
        Step::new("getBlog").with_param("id", "x"),
        Step::new("getAuthor").with_param("id", "y"),
        Step::new("listBlogs"),
        Step::new("listAuthors"),
        Step::new("unknownTool"),
    ];
    for mode in [ExecutionMode::Parallel, ExecutionMode::Chained] {
        let result = engine
            .invoke(RunRequest::new("p", steps.clone()).with_mode(mode))
            .await
            .unwrap();
        let summary = &result.results;
        assert_eq!(summary.total_executions, 5);
        assert_eq!(summary.total_executions, summary.successful + summary.failed);
        assert_eq!(summary.successful, 1);
        assert_eq!(result.errors.len(), summary.failed);
        assert!(result.executions.iter().all(|r| r.is_terminal()));
    }
}

#[tokio::test]
async fn cyclic_plan_is_rejected_before_any_call() {
    let provider = Arc::new(MockToolProvider::new());
    let engine = engine_with(provider.clone());

    let steps = vec![
        Step::new("createBlog").after("createComment"),
        Step::new("createComment").after("createBlog"),
    ];
    let err = engine.run_plan("p", steps.clone()).await.unwrap_err();
    assert!(matches!(err, EngineError::CyclicDependency(_)));

    let err = engine.invoke(RunRequest::new("p", steps)).await.unwrap_err();
    assert!(matches!(err, EngineError::CyclicDependency(_)));
    assert!(provider.calls().is_empty());
}

#[tokio::test]
async fn events_bracket_the_run() {
    let bus = Arc::new(EventBus::new(32));
    let mut rx = bus.subscribe();
    let engine = engine_with(Arc::new(MockToolProvider::new())).with_event_bus(bus);

    let result = engine
        .invoke(RunRequest::new("p", vec![Step::new("listBlogs"), Step::new("nope")]))
        .await
        .unwrap();

    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }

    assert!(matches!(
        events.first(),
        Some(ExecutionEvent::RunStarted { steps: 2, .. })
    ));
    assert!(events.iter().any(|e| matches!(
        e,
        ExecutionEvent::StepFailed { tool, .. } if tool == "nope"
    )));
    match events.last() {
        Some(ExecutionEvent::RunCompleted { run_id, summary }) => {
            assert_eq!(run_id, &result.run_id);
            assert_eq!(summary, &result.results);
        }
        other => panic!("expected RunCompleted, got {:?}", other),
    }
}

#[tokio::test]
async fn serialized_parameters_are_decoded() {
    let provider = Arc::new(MockToolProvider::new());
    let engine = engine_with(provider.clone());

    let step: Step = serde_json::from_value(json!({
        "toolName": "createAuthor",
        "parameters": "{\"name\": \"Bob\", \"email\": \"bob@x.com\"}"
    }))
    .unwrap();
    let broken: Step = serde_json::from_value(json!({
        "toolName": "listBlogs",
        "parameters": "{oops"
    }))
    .unwrap();

    let result = engine.invoke(RunRequest::new("p", vec![step, broken])).await.unwrap();
    assert_eq!(result.results.successful, 1);
    assert!(result.errors[0].starts_with("listBlogs: Invalid parameters"));
    assert_eq!(provider.called_tools(), vec!["createAuthor"]);
}
