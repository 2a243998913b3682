use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use async_trait::async_trait;
use tracing_subscriber::fmt::MakeWriter;

use crate::llm::{Completion, Llm, Prompt};

type Handler = Box<dyn Fn(&Prompt) -> Option<String> + Send + Sync>;

/// Answers every prompt through `handler`; `None` simulates a failed call.
pub struct FakeLlm {
    handler: Handler,
    calls: AtomicUsize,
}

impl FakeLlm {
    pub fn new(handler: impl Fn(&Prompt) -> Option<String> + Send + Sync + 'static) -> Arc<Self> {
        Arc::new(Self { handler: Box::new(handler), calls: AtomicUsize::new(0) })
    }

    /// The handler's answer to one prompt, without counting a call.
    pub fn answer(&self, prompt: &Prompt) -> Option<String> {
        (self.handler)(prompt)
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Llm for FakeLlm {
    async fn chat_many(&self, prompts: Vec<Prompt>) -> Result<Vec<Option<Completion>>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(prompts.iter().map(|p| self.answer(p).map(Completion::text)).collect())
    }
}

/// Collects formatted log output so tests can assert on warnings.
#[derive(Clone, Default)]
pub struct LogBuffer(Arc<Mutex<Vec<u8>>>);

impl LogBuffer {
    /// Runs `f` with a subscriber writing into this buffer.
    pub fn capture<R>(&self, f: impl FnOnce() -> R) -> R {
        let subscriber = tracing_subscriber::fmt()
            .with_writer(self.clone())
            .with_ansi(false)
            .finish();
        tracing::subscriber::with_default(subscriber, f)
    }

    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
    }
}

impl std::io::Write for LogBuffer {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for LogBuffer {
    type Writer = LogBuffer;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}
