//! In-memory queue provider.
//!
//! Simulates topics, queues and raw-delivery subscriptions inside the
//! process. Deliveries honour queue policies the way the real provider does:
//! a topic only reaches queues whose policy admits it. Read messages stay in
//! flight until deleted and can be made visible again with
//! `expire_in_flight`.
//!
//! Every facade operation is counted, and failures can be queued up per
//! operation for tests.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use uuid::Uuid;

use super::facade::{QueueFacade, QueueMessage};
use crate::bus::{BusError, Result};

/// Facade operations, for counting and failure injection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FacadeOp {
    CreateTopic,
    Publish,
    Subscribe,
    Unsubscribe,
    CreateQueue,
    GetQueueArn,
    SetQueuePolicy,
    ReadQueue,
    DeleteMessage,
    DeleteQueue,
}

#[derive(Debug, Default)]
struct MemoryTopic {
    subscriptions: HashSet<String>,
}

#[derive(Debug)]
struct MemoryQueue {
    arn: String,
    visible: VecDeque<QueueMessage>,
    in_flight: Vec<QueueMessage>,
    allowed_topics: HashSet<String>,
}

#[derive(Debug, Default)]
struct State {
    configured: bool,
    topics: HashMap<String, MemoryTopic>,
    queues: HashMap<String, MemoryQueue>,
    subscriptions: HashMap<String, (String, String)>,
    calls: HashMap<FacadeOp, usize>,
    failures: HashMap<FacadeOp, VecDeque<BusError>>,
}

impl State {
    fn enter(&mut self, op: FacadeOp) -> Result<()> {
        *self.calls.entry(op).or_default() += 1;
        match self.failures.get_mut(&op).and_then(VecDeque::pop_front) {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn queue_mut(&mut self, queue_url: &str) -> Result<&mut MemoryQueue> {
        self.queues.get_mut(queue_url).ok_or_else(|| {
            BusError::FatalProvider(format!("queue does not exist: {}", queue_url))
        })
    }
}

/// Process-local stand-in for the cloud provider.
pub struct MemoryQueueFacade {
    state: Mutex<State>,
    max_messages: usize,
}

const TOPIC_ARN_PREFIX: &str = "arn:memory:topic:";
const QUEUE_ARN_PREFIX: &str = "arn:memory:queue:";
const QUEUE_URL_PREFIX: &str = "memory://queue/";

impl MemoryQueueFacade {
    pub fn new() -> Self {
        Self::with_max_messages(10)
    }

    /// Cap how many messages one read returns.
    pub fn with_max_messages(max_messages: usize) -> Self {
        Self {
            state: Mutex::new(State {
                configured: true,
                ..State::default()
            }),
            max_messages: max_messages.max(1),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_configured(&self, configured: bool) {
        self.state().configured = configured;
    }

    /// Fail the next call of `op` with `error`. Queued failures are used in order.
    pub fn fail_next(&self, op: FacadeOp, error: BusError) {
        self.state()
            .failures
            .entry(op)
            .or_default()
            .push_back(error);
    }

    /// Number of times `op` has been invoked.
    pub fn calls(&self, op: FacadeOp) -> usize {
        self.state().calls.get(&op).copied().unwrap_or(0)
    }

    /// URL a queue of this name has, whether or not it exists.
    pub fn queue_url_for(name: &str) -> String {
        format!("{}{}", QUEUE_URL_PREFIX, name)
    }

    pub fn queue_exists(&self, queue_url: &str) -> bool {
        self.state().queues.contains_key(queue_url)
    }

    pub fn queue_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .state()
            .queues
            .keys()
            .map(|url| url.trim_start_matches(QUEUE_URL_PREFIX).to_string())
            .collect();
        names.sort();
        names
    }

    /// Messages waiting to be read.
    pub fn visible_count(&self, queue_url: &str) -> usize {
        self.state()
            .queues
            .get(queue_url)
            .map(|q| q.visible.len())
            .unwrap_or(0)
    }

    /// Messages read but not yet deleted.
    pub fn in_flight_count(&self, queue_url: &str) -> usize {
        self.state()
            .queues
            .get(queue_url)
            .map(|q| q.in_flight.len())
            .unwrap_or(0)
    }

    pub fn subscription_count(&self) -> usize {
        self.state().subscriptions.len()
    }

    /// Enqueue a message directly, bypassing topics.
    ///
    /// Each call gets a fresh receipt handle, so pushing the same id twice
    /// models a provider redelivery.
    pub fn push_message(&self, queue_url: &str, id: &str, body: &str) -> Result<()> {
        let mut state = self.state();
        let queue = state.queue_mut(queue_url)?;
        queue.visible.push_back(QueueMessage {
            id: id.to_string(),
            receipt_handle: Uuid::new_v4().to_string(),
            body: body.to_string(),
        });
        Ok(())
    }

    /// Return every undeleted message to the queue with a new receipt handle.
    pub fn expire_in_flight(&self, queue_url: &str) -> Result<()> {
        let mut state = self.state();
        let queue = state.queue_mut(queue_url)?;
        for mut message in queue.in_flight.drain(..) {
            message.receipt_handle = Uuid::new_v4().to_string();
            queue.visible.push_back(message);
        }
        Ok(())
    }
}

impl Default for MemoryQueueFacade {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl QueueFacade for MemoryQueueFacade {
    fn is_configured(&self) -> bool {
        self.state().configured
    }

    async fn create_or_retrieve_topic(&self, name: &str) -> Result<String> {
        let mut state = self.state();
        state.enter(FacadeOp::CreateTopic)?;
        let arn = format!("{}{}", TOPIC_ARN_PREFIX, name);
        state.topics.entry(arn.clone()).or_default();
        Ok(arn)
    }

    async fn publish_message_to_topic(
        &self,
        topic_arn: &str,
        _subject: &str,
        message: &str,
    ) -> Result<String> {
        let mut state = self.state();
        state.enter(FacadeOp::Publish)?;

        let subscriptions: Vec<String> = state
            .topics
            .get(topic_arn)
            .ok_or_else(|| BusError::FatalProvider(format!("topic does not exist: {}", topic_arn)))?
            .subscriptions
            .iter()
            .cloned()
            .collect();

        for subscription in subscriptions {
            let Some((_, queue_arn)) = state.subscriptions.get(&subscription).cloned() else {
                continue;
            };
            let queue = state
                .queues
                .values_mut()
                .find(|q| q.arn == queue_arn && q.allowed_topics.contains(topic_arn));
            if let Some(queue) = queue {
                queue.visible.push_back(QueueMessage {
                    id: Uuid::new_v4().to_string(),
                    receipt_handle: Uuid::new_v4().to_string(),
                    body: message.to_string(),
                });
            }
        }

        Ok(Uuid::new_v4().to_string())
    }

    async fn subscribe_queue_to_topic(&self, queue_arn: &str, topic_arn: &str) -> Result<String> {
        let mut state = self.state();
        state.enter(FacadeOp::Subscribe)?;

        let arn = format!("{}:{}", topic_arn, Uuid::new_v4());
        state
            .topics
            .get_mut(topic_arn)
            .ok_or_else(|| BusError::FatalProvider(format!("topic does not exist: {}", topic_arn)))?
            .subscriptions
            .insert(arn.clone());
        state
            .subscriptions
            .insert(arn.clone(), (topic_arn.to_string(), queue_arn.to_string()));
        Ok(arn)
    }

    async fn unsubscribe_queue_from_topic(&self, subscription_arn: &str) -> Result<()> {
        let mut state = self.state();
        state.enter(FacadeOp::Unsubscribe)?;

        if let Some((topic_arn, _)) = state.subscriptions.remove(subscription_arn) {
            if let Some(topic) = state.topics.get_mut(&topic_arn) {
                topic.subscriptions.remove(subscription_arn);
            }
        }
        Ok(())
    }

    async fn create_or_retrieve_queue(&self, name: &str) -> Result<String> {
        let mut state = self.state();
        state.enter(FacadeOp::CreateQueue)?;

        let url = Self::queue_url_for(name);
        state.queues.entry(url.clone()).or_insert_with(|| MemoryQueue {
            arn: format!("{}{}", QUEUE_ARN_PREFIX, name),
            visible: VecDeque::new(),
            in_flight: Vec::new(),
            allowed_topics: HashSet::new(),
        });
        Ok(url)
    }

    async fn get_queue_arn(&self, queue_url: &str) -> Result<String> {
        let mut state = self.state();
        state.enter(FacadeOp::GetQueueArn)?;
        Ok(state.queue_mut(queue_url)?.arn.clone())
    }

    async fn set_queue_policy_for_topic_publish(
        &self,
        queue_url: &str,
        _queue_arn: &str,
        topic_arn: &str,
    ) -> Result<()> {
        let mut state = self.state();
        state.enter(FacadeOp::SetQueuePolicy)?;
        state
            .queue_mut(queue_url)?
            .allowed_topics
            .insert(topic_arn.to_string());
        Ok(())
    }

    async fn read_queue(&self, queue_url: &str) -> Result<Vec<QueueMessage>> {
        let mut state = self.state();
        state.enter(FacadeOp::ReadQueue)?;

        let queue = state.queue_mut(queue_url)?;
        let take = queue.visible.len().min(self.max_messages);
        let batch: Vec<QueueMessage> = queue.visible.drain(..take).collect();
        queue.in_flight.extend(batch.iter().cloned());
        Ok(batch)
    }

    async fn delete_message(&self, queue_url: &str, receipt_handle: &str) -> Result<()> {
        let mut state = self.state();
        state.enter(FacadeOp::DeleteMessage)?;
        let queue = state.queue_mut(queue_url)?;
        queue.in_flight.retain(|m| m.receipt_handle != receipt_handle);
        Ok(())
    }

    async fn delete_queue(&self, queue_url: &str) -> Result<()> {
        let mut state = self.state();
        state.enter(FacadeOp::DeleteQueue)?;
        state.queues.remove(queue_url);
        Ok(())
    }
}
