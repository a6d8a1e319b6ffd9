//! Async manager behavior: concurrent fan-out, sync handler offload, and
//! payload equivalence with the sync manager.

mod common;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use runflow::{
    AsyncCallbackHandler, AsyncCallbackManager, CallbackManager, Handler, LlmResult, Result, Run,
};
use serde_json::json;

use common::RecordingHandler;

#[tokio::test]
async fn async_and_sync_managers_deliver_identical_payloads() {
    let sync_recorder = RecordingHandler::new();
    let async_recorder = RecordingHandler::new();

    let sync_manager =
        CallbackManager::with_handlers(vec![Handler::sync(sync_recorder.clone())])
            .with_verbose(true);
    let async_manager =
        AsyncCallbackManager::with_handlers(vec![Handler::sync(async_recorder.clone())])
            .with_verbose(true);

    let scoped = sync_manager.on_llm_start(json!({"name": "m"}), vec!["prompt".into()]);
    scoped.on_llm_new_token("tok");
    scoped.on_llm_end(LlmResult::from_generations(vec!["done".into()]));

    let scoped = async_manager
        .on_llm_start(json!({"name": "m"}), vec!["prompt".into()])
        .await;
    scoped.on_llm_new_token("tok").await;
    scoped
        .on_llm_end(LlmResult::from_generations(vec!["done".into()]))
        .await;

    let sync_records = sync_recorder.records();
    let async_records = async_recorder.records();
    assert_eq!(sync_records.len(), async_records.len());
    for (s, a) in sync_records.iter().zip(&async_records) {
        assert_eq!(s.event, a.event);
        assert_eq!(s.payload, a.payload);
        assert_eq!(s.execution_order, a.execution_order);
    }
}

#[tokio::test]
async fn mixed_handlers_all_receive_each_event() {
    let as_sync = RecordingHandler::new();
    let as_async = RecordingHandler::new();
    let manager = AsyncCallbackManager::with_handlers(vec![
        Handler::sync(as_sync.clone()),
        Handler::asynchronous(as_async.clone()),
    ])
    .with_verbose(true);

    let chain = manager
        .on_chain_start(json!({"name": "c"}), HashMap::new())
        .await;
    chain.on_text("working").await;
    chain.on_chain_end(HashMap::new()).await;

    assert_eq!(as_sync.event_names(), vec!["chain_start", "text", "chain_end"]);
    assert_eq!(as_async.event_names(), vec!["chain_start", "text", "chain_end"]);
}

#[tokio::test]
async fn slow_async_handler_completes_before_dispatch_returns() {
    struct Slow {
        done: Arc<std::sync::atomic::AtomicBool>,
    }

    #[async_trait]
    impl AsyncCallbackHandler for Slow {
        async fn on_llm_start(&self, _run: &Run, _prompts: &[String]) -> Result<()> {
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.done.store(true, std::sync::atomic::Ordering::SeqCst);
            Ok(())
        }
    }

    let done = Arc::new(std::sync::atomic::AtomicBool::new(false));
    let manager = AsyncCallbackManager::with_handlers(vec![Handler::asynchronous(Slow {
        done: Arc::clone(&done),
    })])
    .with_verbose(true);

    manager.on_llm_start(json!({"name": "m"}), vec![]).await;
    assert!(done.load(std::sync::atomic::Ordering::SeqCst));
}

#[tokio::test]
async fn failing_async_handler_is_isolated() {
    struct Failing;

    #[async_trait]
    impl AsyncCallbackHandler for Failing {
        async fn on_chain_start(
            &self,
            _run: &Run,
            _inputs: &HashMap<String, serde_json::Value>,
        ) -> Result<()> {
            Err(runflow::Error::handler("broken async sink"))
        }
    }

    let recorder = RecordingHandler::new();
    let manager = AsyncCallbackManager::with_handlers(vec![
        Handler::asynchronous(Failing),
        Handler::sync(recorder.clone()),
    ])
    .with_verbose(true);

    let chain = manager
        .on_chain_start(json!({"name": "c"}), HashMap::new())
        .await;
    let run = chain.on_chain_end(HashMap::new()).await;

    assert!(run.is_finished());
    assert_eq!(recorder.event_names(), vec!["chain_start", "chain_end"]);
}

#[tokio::test]
async fn async_get_child_extends_the_forest() {
    let recorder = RecordingHandler::new();
    let manager =
        AsyncCallbackManager::with_handlers(vec![Handler::sync(recorder.clone())])
            .with_verbose(true);

    let chain = manager
        .on_chain_start(json!({"name": "outer"}), HashMap::new())
        .await;
    let tool = chain
        .get_child(Some("lookup"))
        .on_tool_start(json!({"name": "search"}), "query".into())
        .await;

    assert_eq!(tool.parent_run_id(), Some(chain.run_id()));
    assert_eq!(tool.run().execution_order, 2);
    assert_eq!(tool.run().tags, vec!["lookup".to_string()]);

    tool.on_tool_end("hit").await;
    chain.on_chain_end(HashMap::new()).await;

    assert_eq!(
        recorder.event_names(),
        vec!["chain_start", "tool_start", "tool_end", "chain_end"]
    );
}

#[tokio::test]
async fn sync_child_of_async_manager_shares_the_forest() {
    let recorder = RecordingHandler::new();
    let manager =
        AsyncCallbackManager::with_handlers(vec![Handler::sync(recorder.clone())])
            .with_verbose(true);

    let chain = manager
        .on_chain_start(json!({"name": "outer"}), HashMap::new())
        .await;
    let sync_child = chain.get_sync_child(None);
    let llm = sync_child.on_llm_start(json!({"name": "m"}), vec![]);

    assert_eq!(llm.parent_run_id(), Some(chain.run_id()));
    assert_eq!(llm.run().execution_order, 2);
}

#[tokio::test]
async fn async_error_terminal_records_failure() {
    let recorder = RecordingHandler::new();
    let manager =
        AsyncCallbackManager::with_handlers(vec![Handler::sync(recorder.clone())])
            .with_verbose(true);

    let scoped = manager.on_llm_start(json!({"name": "m"}), vec![]).await;
    let run = scoped.on_llm_error("rate limited").await;

    assert_eq!(run.error.as_deref(), Some("rate limited"));
    let records = recorder.records();
    assert_eq!(records[1].event, "llm_error");
    assert_eq!(records[1].payload, json!({"error": "rate limited"}));
}
