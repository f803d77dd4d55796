//! Scripted invoker for tests.

use crate::client::Client;
use crate::clock::FrozenClock;
use crate::error::QuillResult;
use crate::registry::ProcessorRegistry;
use crate::script::ScriptInvoker;
use async_trait::async_trait;
use parking_lot::Mutex;
use redis::Value;
use std::collections::VecDeque;
use std::sync::Arc;

/// Records every invocation and replays queued replies; missing replies
/// default to nil.
#[derive(Default)]
pub struct RecordingInvoker {
    calls: Mutex<Vec<(String, Vec<String>)>>,
    replies: Mutex<VecDeque<QuillResult<Value>>>,
    commands: Mutex<Vec<Vec<String>>>,
    command_replies: Mutex<VecDeque<QuillResult<Value>>>,
    pipelines: Mutex<usize>,
    pipeline_replies: Mutex<VecDeque<QuillResult<Value>>>,
}

impl RecordingInvoker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn push_reply(&self, reply: QuillResult<Value>) {
        self.replies.lock().push_back(reply);
    }

    pub fn push_command_reply(&self, reply: QuillResult<Value>) {
        self.command_replies.lock().push_back(reply);
    }

    pub fn push_pipeline_reply(&self, reply: QuillResult<Value>) {
        self.pipeline_replies.lock().push_back(reply);
    }

    /// Script invocations so far, as (command, args).
    pub fn calls(&self) -> Vec<(String, Vec<String>)> {
        self.calls.lock().clone()
    }

    /// Raw commands so far, each as its argv.
    pub fn commands(&self) -> Vec<Vec<String>> {
        self.commands.lock().clone()
    }

    pub fn pipeline_count(&self) -> usize {
        *self.pipelines.lock()
    }
}

#[async_trait]
impl ScriptInvoker for RecordingInvoker {
    async fn invoke(&self, command: &str, args: Vec<String>) -> QuillResult<Value> {
        self.calls.lock().push((command.to_string(), args));
        self.replies
            .lock()
            .pop_front()
            .unwrap_or(Ok(Value::Nil))
    }

    async fn command(&self, cmd: redis::Cmd) -> QuillResult<Value> {
        let argv = cmd
            .args_iter()
            .map(|arg| match arg {
                redis::Arg::Simple(bytes) => String::from_utf8_lossy(bytes).to_string(),
                redis::Arg::Cursor => "<cursor>".to_string(),
            })
            .collect();
        self.commands.lock().push(argv);
        self.command_replies
            .lock()
            .pop_front()
            .unwrap_or(Ok(Value::Nil))
    }

    async fn pipeline(&self, _pipe: redis::Pipeline) -> QuillResult<Value> {
        *self.pipelines.lock() += 1;
        self.pipeline_replies
            .lock()
            .pop_front()
            .unwrap_or(Ok(Value::Okay))
    }
}

/// A client over a recording invoker, a frozen clock, and an empty registry.
pub fn test_client(invoker: Arc<RecordingInvoker>) -> Client {
    test_client_with_registry(invoker, ProcessorRegistry::new())
}

pub fn test_client_with_registry(
    invoker: Arc<RecordingInvoker>,
    registry: ProcessorRegistry,
) -> Client {
    Client::from_parts(
        invoker,
        redis::Client::open("redis://127.0.0.1/").expect("static url"),
        Arc::new(FrozenClock(1625072912.0)),
        Arc::new(registry),
        "test-worker".to_string(),
    )
}
