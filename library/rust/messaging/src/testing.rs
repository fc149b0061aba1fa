//! テスト用のインメモリ実装。
//! `testing` フィーチャー（またはクレート内テスト）で有効化される。

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;

use crate::error::{BoxError, MessagingError};
use crate::transport::{ConsumedMessage, MessageReader, OutboundMessage, TopicWriter, WriterFactory};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Default)]
struct TopicState {
    created: usize,
    closed: usize,
    messages: Vec<OutboundMessage>,
    block_writes: bool,
    write_failures: VecDeque<String>,
    fail_close: bool,
}

type SharedTopics = Arc<Mutex<HashMap<String, TopicState>>>;

/// InMemoryWriterFactory はコネクション生成回数と送信メッセージを記録する WriterFactory。
#[derive(Default)]
pub struct InMemoryWriterFactory {
    topics: SharedTopics,
    create_delay: Duration,
}

impl InMemoryWriterFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// コネクション生成に時間がかかる状況を再現する。
    pub fn with_create_delay(mut self, delay: Duration) -> Self {
        self.create_delay = delay;
        self
    }

    /// topic のコネクションが生成された回数を返す。
    pub fn created(&self, topic: &str) -> usize {
        lock(&self.topics).get(topic).map_or(0, |t| t.created)
    }

    /// topic のコネクションが閉じられた回数を返す。
    pub fn closed(&self, topic: &str) -> usize {
        lock(&self.topics).get(topic).map_or(0, |t| t.closed)
    }

    /// topic に送信されたメッセージを返す。
    pub fn messages(&self, topic: &str) -> Vec<OutboundMessage> {
        lock(&self.topics)
            .get(topic)
            .map(|t| t.messages.clone())
            .unwrap_or_default()
    }

    /// topic への書き込みを応答が返らない状態にする。
    pub fn block_writes(&self, topic: &str) {
        lock(&self.topics).entry(topic.to_string()).or_default().block_writes = true;
    }

    /// topic への次の書き込みを reason で失敗させる。複数回呼ぶと順に消費される。
    pub fn fail_next_write(&self, topic: &str, reason: &str) {
        lock(&self.topics)
            .entry(topic.to_string())
            .or_default()
            .write_failures
            .push_back(reason.to_string());
    }

    /// topic のコネクションのクローズを失敗させる。
    pub fn fail_close(&self, topic: &str) {
        lock(&self.topics).entry(topic.to_string()).or_default().fail_close = true;
    }
}

impl WriterFactory for InMemoryWriterFactory {
    fn create(&self, topic: &str) -> Result<Arc<dyn TopicWriter>, MessagingError> {
        if !self.create_delay.is_zero() {
            std::thread::sleep(self.create_delay);
        }
        lock(&self.topics).entry(topic.to_string()).or_default().created += 1;
        Ok(Arc::new(InMemoryTopicWriter {
            topic: topic.to_string(),
            topics: Arc::clone(&self.topics),
        }))
    }
}

struct InMemoryTopicWriter {
    topic: String,
    topics: SharedTopics,
}

#[async_trait]
impl TopicWriter for InMemoryTopicWriter {
    async fn write(&self, message: OutboundMessage) -> Result<(), BoxError> {
        let blocked = {
            let mut topics = lock(&self.topics);
            let state = topics.entry(self.topic.clone()).or_default();
            if let Some(reason) = state.write_failures.pop_front() {
                return Err(reason.into());
            }
            if !state.block_writes {
                state.messages.push(message);
            }
            state.block_writes
        };
        if blocked {
            std::future::pending::<()>().await;
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), BoxError> {
        let mut topics = lock(&self.topics);
        let state = topics.entry(self.topic.clone()).or_default();
        state.closed += 1;
        if state.fail_close {
            return Err(format!("failed to flush {}", self.topic).into());
        }
        Ok(())
    }
}

/// consumed_message はテスト用の ConsumedMessage を生成する。
pub fn consumed_message(topic: &str, offset: i64, value: impl Into<Vec<u8>>) -> ConsumedMessage {
    ConsumedMessage {
        topic: topic.to_string(),
        partition: 0,
        offset,
        key: Some(format!("key-{offset}").into_bytes()),
        value: value.into(),
        timestamp: None,
    }
}

enum FetchStep {
    Message(ConsumedMessage),
    Error(String),
}

/// ScriptedReader は事前に積んだ順にフェッチ結果を返す MessageReader。
///
/// 積んだ結果を使い切ると、キャンセルされるまでフェッチがブロックする。
/// rewind はメッセージを先頭に積み直し、ブローカーのシークと同じく次のフェッチで再配信する。
#[derive(Default)]
pub struct ScriptedReader {
    steps: Mutex<VecDeque<FetchStep>>,
    fetches: AtomicUsize,
    commits: Mutex<Vec<ConsumedMessage>>,
    commit_failures: Mutex<VecDeque<String>>,
    rewinds: Mutex<Vec<i64>>,
    rewind_failures: Mutex<VecDeque<String>>,
    fail_close: AtomicBool,
    closed: AtomicBool,
    drained: Notify,
}

impl ScriptedReader {
    pub fn new() -> Self {
        Self::default()
    }

    /// フェッチ結果としてメッセージを積む。
    pub fn push_message(&self, message: ConsumedMessage) {
        lock(&self.steps).push_back(FetchStep::Message(message));
    }

    /// フェッチ結果としてエラーを積む。
    pub fn push_error(&self, reason: &str) {
        lock(&self.steps).push_back(FetchStep::Error(reason.to_string()));
    }

    /// 次のコミットを reason で失敗させる。複数回呼ぶと順に消費される。
    pub fn fail_next_commit(&self, reason: &str) {
        lock(&self.commit_failures).push_back(reason.to_string());
    }

    /// 次の rewind を reason で失敗させる。
    pub fn fail_next_rewind(&self, reason: &str) {
        lock(&self.rewind_failures).push_back(reason.to_string());
    }

    pub fn fail_close(&self) {
        self.fail_close.store(true, Ordering::SeqCst);
    }

    /// fetch が呼ばれた回数を返す。
    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    /// コミットに成功したメッセージを返す。
    pub fn commits(&self) -> Vec<ConsumedMessage> {
        lock(&self.commits).clone()
    }

    /// 読み込み位置を戻したオフセットを順に返す。
    pub fn rewinds(&self) -> Vec<i64> {
        lock(&self.rewinds).clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// 積んだ結果をすべて消費し、次のフェッチがブロックするまで待つ。
    pub async fn wait_until_drained(&self) {
        self.drained.notified().await;
    }
}

#[async_trait]
impl MessageReader for ScriptedReader {
    async fn fetch(&self) -> Result<ConsumedMessage, BoxError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let step = lock(&self.steps).pop_front();
        match step {
            Some(FetchStep::Message(message)) => Ok(message),
            Some(FetchStep::Error(reason)) => Err(reason.into()),
            None => {
                self.drained.notify_one();
                std::future::pending().await
            }
        }
    }

    async fn commit(&self, message: &ConsumedMessage) -> Result<(), BoxError> {
        if let Some(reason) = lock(&self.commit_failures).pop_front() {
            return Err(reason.into());
        }
        lock(&self.commits).push(message.clone());
        Ok(())
    }

    async fn rewind(&self, message: &ConsumedMessage) -> Result<(), BoxError> {
        if let Some(reason) = lock(&self.rewind_failures).pop_front() {
            return Err(reason.into());
        }
        lock(&self.rewinds).push(message.offset);
        lock(&self.steps).push_front(FetchStep::Message(message.clone()));
        Ok(())
    }

    async fn close(&self) -> Result<(), BoxError> {
        if self.fail_close.load(Ordering::SeqCst) {
            return Err("reader already closed".into());
        }
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}
