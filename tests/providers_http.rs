use std::sync::Arc;

use ditto_imagegen::{
    Accounting, BatchError, BatchExecutor, EngineConfig, Env, ErrorKind, InMemoryLedger,
    ProviderRegistry, Task, TaskStatus,
};
use httpmock::{
    Method::{GET, POST},
    MockServer,
};
use serde_json::json;

fn env() -> Env {
    Env::isolated([
        ("OPENAI_API_KEY".to_string(), "sk-test".to_string()),
        ("BFL_API_KEY".to_string(), "bfl-test".to_string()),
    ])
}

fn registry(toml: &str) -> Arc<ProviderRegistry> {
    let config = EngineConfig::from_toml_str(toml).expect("config");
    Arc::new(ProviderRegistry::from_config(&config, &env()).expect("registry"))
}

#[tokio::test]
async fn dalle_batch_is_charged_dalle_cost() -> Result<(), BatchError> {
    let server = MockServer::start_async().await;
    let mock = server
        .mock_async(|when, then| {
            when.method(POST)
                .path("/v1/images/generations")
                .header("authorization", "Bearer sk-test")
                .body_includes("\"prompt\":\"a cat\"");
            then.status(200)
                .header("content-type", "application/json")
                .json_body(json!({ "data": [{ "url": "https://cdn.example/cat.png" }] }));
        })
        .await;

    let registry = registry(&format!(
        "[providers.dalle]\nbase_url = \"{}\"\n",
        server.url("/v1")
    ));
    let dalle_cost = registry.credit_cost("dalle").expect("dalle cost");
    let ledger = Arc::new(InMemoryLedger::with_account("u1", 100));
    let executor = BatchExecutor::new(registry, ledger);

    let report = executor.run("u1", vec![Task::new("a cat", "dalle")]).await?;

    mock.assert_async().await;
    assert_eq!(report.total_tasks, 1);
    assert_eq!(report.successful, 1);
    assert_eq!(report.failed, 0);
    assert_eq!(report.credits_charged(), dalle_cost);
    assert_eq!(report.credits_remaining, Some(100 - dalle_cost));

    let wire = serde_json::to_value(&report).expect("report json");
    assert_eq!(wire["results"][0]["imageUrl"], "https://cdn.example/cat.png");
    assert_eq!(wire["results"][0]["status"], "Success");
    Ok(())
}

#[tokio::test]
async fn unknown_provider_makes_no_http_call() {
    let server = MockServer::start_async().await;
    let mock = server
        .mock_async(|when, then| {
            when.method(POST).path("/v1/images/generations");
            then.status(200)
                .header("content-type", "application/json")
                .json_body(json!({ "data": [{ "url": "https://cdn.example/cat.png" }] }));
        })
        .await;

    let registry = registry(&format!(
        "[providers.dalle]\nbase_url = \"{}\"\n",
        server.url("/v1")
    ));
    let ledger = Arc::new(InMemoryLedger::with_account("u1", 100));
    let executor = BatchExecutor::new(registry, ledger.clone());

    let err = executor
        .run(
            "u1",
            vec![
                Task::new("a cat", "dalle"),
                Task::new("b", "unknown-provider"),
            ],
        )
        .await
        .expect_err("unknown provider");

    assert!(matches!(err, BatchError::UnknownProvider { .. }));
    mock.assert_calls(0);
    assert!(ledger.usage_log("u1").await.is_empty());
}

#[tokio::test]
async fn malformed_json_fails_exactly_one_task() -> Result<(), BatchError> {
    let good = MockServer::start_async().await;
    good.mock_async(|when, then| {
        when.method(POST).path("/v1/images/generations");
        then.status(200)
            .header("content-type", "application/json")
            .json_body(json!({ "data": [{ "url": "https://cdn.example/ok.png" }] }));
    })
    .await;
    let bad = MockServer::start_async().await;
    bad.mock_async(|when, then| {
        when.method(POST).path("/v1/images/generations");
        then.status(200)
            .header("content-type", "application/json")
            .body("{\"data\": [");
    })
    .await;

    let registry = registry(&format!(
        "[providers.dalle]\nbase_url = \"{}\"\n\n[providers.gpt-image-1]\nbase_url = \"{}\"\n",
        good.url("/v1"),
        bad.url("/v1")
    ));
    let ledger = Arc::new(InMemoryLedger::with_account("u1", 100));
    let executor = BatchExecutor::new(registry, ledger);

    let report = executor
        .run(
            "u1",
            vec![
                Task::new("one", "dalle"),
                Task::new("two", "gpt-image-1"),
                Task::new("three", "dalle"),
            ],
        )
        .await?;

    assert_eq!(report.successful, 2);
    assert_eq!(report.failed, 1);
    assert_eq!(report.results[1].status, TaskStatus::Failed);
    assert_eq!(report.results[1].error_kind, Some(ErrorKind::Provider));
    assert!(
        report.results[1]
            .error
            .as_deref()
            .is_some_and(|e| e.contains("{\"data\": ["))
    );
    assert_eq!(report.credits_used, 20);
    assert_eq!(report.accounting, Accounting::Charged);
    Ok(())
}

#[tokio::test]
async fn missing_credential_fails_only_that_providers_tasks() -> Result<(), BatchError> {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(POST).path("/v1/images/generations");
            then.status(200)
                .header("content-type", "application/json")
                .json_body(json!({ "data": [{ "url": "https://cdn.example/ok.png" }] }));
        })
        .await;

    let registry = registry(&format!(
        "[providers.dalle]\nbase_url = \"{}\"\n",
        server.url("/v1")
    ));
    let ledger = Arc::new(InMemoryLedger::with_account("u1", 100));
    let executor = BatchExecutor::new(registry, ledger);

    let report = executor
        .run(
            "u1",
            vec![Task::new("one", "dalle"), Task::new("two", "minimax")],
        )
        .await?;

    assert_eq!(report.results[0].status, TaskStatus::Success);
    assert_eq!(report.results[1].error_kind, Some(ErrorKind::Configuration));
    assert!(
        report.results[1]
            .error
            .as_deref()
            .is_some_and(|e| e.contains("MINIMAX_API_KEY"))
    );
    assert_eq!(report.credits_used, 10);
    Ok(())
}

#[tokio::test]
async fn bfl_job_completes_through_the_batch() -> Result<(), BatchError> {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(POST)
                .path("/v1/flux-dev")
                .header("x-key", "bfl-test");
            then.status(200)
                .header("content-type", "application/json")
                .json_body(json!({
                    "id": "job-9",
                    "polling_url": server.url("/v1/get_result?id=job-9")
                }));
        })
        .await;
    let poll = server
        .mock_async(|when, then| {
            when.method(GET).path("/v1/get_result").query_param("id", "job-9");
            then.status(200)
                .header("content-type", "application/json")
                .json_body(json!({
                    "status": "Ready",
                    "result": { "sample": "https://delivery.example/job-9.png" }
                }));
        })
        .await;

    let registry = registry(&format!(
        "[providers.flux-dev]\nbase_url = \"{}\"\ncredit_cost = 4\n",
        server.base_url()
    ));
    let ledger = Arc::new(InMemoryLedger::with_account("u1", 10));
    let executor = BatchExecutor::new(registry, ledger);

    let report = executor
        .run("u1", vec![Task::new("a lighthouse", "FLUX-DEV")])
        .await?;

    poll.assert_calls(1);
    assert_eq!(report.successful, 1);
    assert_eq!(
        report.results[0].image.as_ref().and_then(|i| i.as_url()),
        Some("https://delivery.example/job-9.png")
    );
    assert_eq!(report.credits_used, 4);
    assert_eq!(report.credits_remaining, Some(6));
    Ok(())
}
