//! Broker state machine
//!
//! Holds queues, fanout exchanges, consumers and unacknowledged deliveries.
//! Every operation takes the single state lock, mutates, then dispatches
//! whatever became deliverable. Deliveries are pushed into each consumer's
//! unbounded channel, so no operation ever awaits while holding the lock.
//!
//! Routing rules:
//! - the default exchange (`""`) routes to the queue named by the routing key
//!   and silently drops the message when no such queue exists
//! - a fanout exchange copies the message to every bound queue
//!
//! Re-declaring an existing queue returns its name and keeps the options of
//! the first declaration.

use crate::common::utils::{generate_consumer_tag, generate_queue_name};
use crate::common::{Error, Result};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use tokio::sync::mpsc;

pub type ChannelId = u64;
pub type DeliveryTag = u64;

/// Message metadata carried next to the body
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Properties {
    pub content_type: Option<String>,
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
    pub persistent: bool,
}

/// A message handed to a consumer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Delivery {
    pub delivery_tag: DeliveryTag,
    pub consumer_tag: String,
    pub redelivered: bool,
    pub exchange: String,
    pub routing_key: String,
    pub properties: Properties,
    pub body: Bytes,
}

/// Queue declaration flags
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueOptions {
    pub durable: bool,
    /// Owned by the declaring channel; deleted when that channel closes
    pub exclusive: bool,
    /// Deleted once its last consumer is cancelled
    pub auto_delete: bool,
    /// Publishes are rejected while this many messages are ready
    pub max_length: Option<usize>,
}

impl QueueOptions {
    pub fn durable() -> Self {
        Self {
            durable: true,
            ..Default::default()
        }
    }

    /// Server-private reply/receiver queue
    pub fn ephemeral() -> Self {
        Self {
            exclusive: true,
            auto_delete: true,
            ..Default::default()
        }
    }

    pub fn with_max_length(mut self, max_length: Option<usize>) -> Self {
        self.max_length = max_length;
        self
    }
}

#[derive(Debug, Clone)]
struct Message {
    exchange: String,
    routing_key: String,
    properties: Properties,
    body: Bytes,
    redelivered: bool,
}

struct Consumer {
    tag: String,
    channel: ChannelId,
    no_ack: bool,
    prefetch: usize,
    in_flight: usize,
    tx: mpsc::UnboundedSender<Delivery>,
}

impl Consumer {
    fn has_capacity(&self) -> bool {
        self.no_ack || self.prefetch == 0 || self.in_flight < self.prefetch
    }
}

struct Queue {
    options: QueueOptions,
    owner: Option<ChannelId>,
    ready: VecDeque<Message>,
    consumers: Vec<Consumer>,
    cursor: usize,
    had_consumer: bool,
}

impl Queue {
    fn new(options: QueueOptions, owner: Option<ChannelId>) -> Self {
        Self {
            options,
            owner,
            ready: VecDeque::new(),
            consumers: Vec::new(),
            cursor: 0,
            had_consumer: false,
        }
    }

    fn check_access(&self, name: &str, channel: ChannelId) -> Result<()> {
        match self.owner {
            Some(owner) if owner != channel => Err(Error::ResourceLocked(format!(
                "queue '{}' is exclusive to another channel",
                name
            ))),
            _ => Ok(()),
        }
    }

    fn is_full(&self) -> bool {
        self.options
            .max_length
            .is_some_and(|max| self.ready.len() >= max)
    }

    fn should_auto_delete(&self) -> bool {
        self.options.auto_delete && self.had_consumer && self.consumers.is_empty()
    }
}

struct Unacked {
    channel: ChannelId,
    queue: String,
    consumer_tag: String,
    message: Message,
}

#[derive(Default)]
struct ChannelState {
    prefetch: usize,
}

#[derive(Default)]
struct BrokerState {
    queues: HashMap<String, Queue>,
    exchanges: HashMap<String, BTreeSet<String>>,
    channels: HashMap<ChannelId, ChannelState>,
    unacked: HashMap<DeliveryTag, Unacked>,
    next_channel: ChannelId,
    next_tag: DeliveryTag,
}

impl BrokerState {
    fn channel(&self, id: ChannelId) -> Result<&ChannelState> {
        self.channels.get(&id).ok_or(Error::ChannelClosed)
    }

    fn remove_queue(&mut self, name: &str) -> usize {
        for bindings in self.exchanges.values_mut() {
            bindings.remove(name);
        }
        match self.queues.remove(name) {
            Some(queue) => {
                tracing::debug!(queue = %name, "queue deleted");
                queue.ready.len()
            }
            None => 0,
        }
    }

    fn release_in_flight(&mut self, queue: &str, consumer_tag: &str) {
        if let Some(q) = self.queues.get_mut(queue) {
            if let Some(c) = q.consumers.iter_mut().find(|c| c.tag == consumer_tag) {
                c.in_flight = c.in_flight.saturating_sub(1);
            }
        }
    }

    /// Push ready messages to consumers with spare prefetch, round-robin.
    fn dispatch(&mut self, name: &str) {
        let Some(queue) = self.queues.get_mut(name) else {
            return;
        };

        while !queue.ready.is_empty() && !queue.consumers.is_empty() {
            let n = queue.consumers.len();
            let picked = (0..n)
                .map(|i| (queue.cursor + i) % n)
                .find(|&idx| queue.consumers[idx].has_capacity());
            let Some(idx) = picked else {
                break;
            };
            let Some(message) = queue.ready.pop_front() else {
                break;
            };

            let delivery_tag = self.next_tag;
            self.next_tag += 1;

            let consumer = &mut queue.consumers[idx];
            let delivery = Delivery {
                delivery_tag,
                consumer_tag: consumer.tag.clone(),
                redelivered: message.redelivered,
                exchange: message.exchange.clone(),
                routing_key: message.routing_key.clone(),
                properties: message.properties.clone(),
                body: message.body.clone(),
            };

            if consumer.tx.send(delivery).is_err() {
                // Receiver is gone: forget the consumer and keep the message
                tracing::debug!(queue = %name, consumer = %consumer.tag, "dropping dead consumer");
                queue.consumers.remove(idx);
                queue.ready.push_front(message);
                queue.cursor = 0;
                continue;
            }

            queue.cursor = (idx + 1) % n;
            if !consumer.no_ack {
                consumer.in_flight += 1;
                self.unacked.insert(
                    delivery_tag,
                    Unacked {
                        channel: consumer.channel,
                        queue: name.to_string(),
                        consumer_tag: consumer.tag.clone(),
                        message,
                    },
                );
            }
        }

        if queue.should_auto_delete() {
            self.remove_queue(name);
        }
    }
}

/// In-process message broker
pub struct Broker {
    state: Mutex<BrokerState>,
}

impl Default for Broker {
    fn default() -> Self {
        Self::new()
    }
}

impl Broker {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(BrokerState::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        // A panic while holding the lock leaves the maps consistent (every
        // mutation is a single insert/remove), so poisoning is ignored.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn open_channel(&self) -> ChannelId {
        let mut state = self.lock();
        state.next_channel += 1;
        let id = state.next_channel;
        state.channels.insert(id, ChannelState::default());
        tracing::trace!(channel = id, "channel opened");
        id
    }

    /// Close a channel: cancel its consumers, requeue its unacked deliveries
    /// and delete the exclusive queues it owns. Closing twice is a no-op.
    pub fn close_channel(&self, channel: ChannelId) {
        let mut state = self.lock();
        if state.channels.remove(&channel).is_none() {
            return;
        }

        let mut touched: BTreeSet<String> = BTreeSet::new();

        // Requeue oldest first so delivery order is preserved
        let mut tags: Vec<DeliveryTag> = state
            .unacked
            .iter()
            .filter(|(_, u)| u.channel == channel)
            .map(|(tag, _)| *tag)
            .collect();
        tags.sort_unstable();
        for tag in tags.into_iter().rev() {
            if let Some(unacked) = state.unacked.remove(&tag) {
                if let Some(queue) = state.queues.get_mut(&unacked.queue) {
                    let mut message = unacked.message;
                    message.redelivered = true;
                    queue.ready.push_front(message);
                    touched.insert(unacked.queue);
                }
            }
        }

        let owned: Vec<String> = state
            .queues
            .iter()
            .filter(|(_, q)| q.owner == Some(channel))
            .map(|(name, _)| name.clone())
            .collect();
        for name in &owned {
            state.remove_queue(name);
            touched.remove(name);
        }

        for (name, queue) in state.queues.iter_mut() {
            let before = queue.consumers.len();
            queue.consumers.retain(|c| c.channel != channel);
            if queue.consumers.len() != before {
                queue.cursor = 0;
                touched.insert(name.clone());
            }
        }

        for name in touched {
            let auto_delete = state
                .queues
                .get(&name)
                .is_some_and(|q| q.should_auto_delete());
            if auto_delete {
                state.remove_queue(&name);
            } else {
                state.dispatch(&name);
            }
        }
        tracing::trace!(channel, "channel closed");
    }

    /// Limit unacknowledged deliveries per consumer created afterwards (0 = unlimited)
    pub fn qos(&self, channel: ChannelId, prefetch: usize) -> Result<()> {
        let mut state = self.lock();
        let ch = state.channels.get_mut(&channel).ok_or(Error::ChannelClosed)?;
        ch.prefetch = prefetch;
        Ok(())
    }

    /// Declare a queue; an empty name asks the broker to generate one.
    pub fn declare_queue(
        &self,
        channel: ChannelId,
        name: &str,
        options: QueueOptions,
    ) -> Result<String> {
        let mut state = self.lock();
        state.channel(channel)?;

        let name = if name.is_empty() {
            generate_queue_name()
        } else {
            name.to_string()
        };

        if let Some(existing) = state.queues.get(&name) {
            existing.check_access(&name, channel)?;
            return Ok(name);
        }

        let owner = options.exclusive.then_some(channel);
        state.queues.insert(name.clone(), Queue::new(options, owner));
        tracing::debug!(queue = %name, ?options, "queue declared");
        Ok(name)
    }

    /// Delete a queue, returning how many ready messages were dropped.
    pub fn delete_queue(&self, channel: ChannelId, name: &str) -> Result<usize> {
        let mut state = self.lock();
        state.channel(channel)?;
        match state.queues.get(name) {
            Some(queue) => queue.check_access(name, channel)?,
            None => return Ok(0),
        }
        Ok(state.remove_queue(name))
    }

    pub fn declare_fanout(&self, channel: ChannelId, name: &str) -> Result<()> {
        if name.is_empty() {
            return Err(Error::Broker("the default exchange cannot be declared".into()));
        }
        let mut state = self.lock();
        state.channel(channel)?;
        state.exchanges.entry(name.to_string()).or_default();
        Ok(())
    }

    pub fn bind_queue(&self, channel: ChannelId, queue: &str, exchange: &str) -> Result<()> {
        let mut state = self.lock();
        state.channel(channel)?;
        state
            .queues
            .get(queue)
            .ok_or_else(|| Error::QueueNotFound(queue.to_string()))?
            .check_access(queue, channel)?;
        state
            .exchanges
            .get_mut(exchange)
            .ok_or_else(|| Error::ExchangeNotFound(exchange.to_string()))?
            .insert(queue.to_string());
        Ok(())
    }

    /// Route a message. Rejected as a whole when any target queue is full.
    pub fn publish(
        &self,
        channel: ChannelId,
        exchange: &str,
        routing_key: &str,
        properties: Properties,
        body: Bytes,
    ) -> Result<()> {
        let mut state = self.lock();
        state.channel(channel)?;

        let targets: Vec<String> = if exchange.is_empty() {
            if state.queues.contains_key(routing_key) {
                vec![routing_key.to_string()]
            } else {
                tracing::trace!(routing_key, "unroutable message dropped");
                Vec::new()
            }
        } else {
            state
                .exchanges
                .get(exchange)
                .ok_or_else(|| Error::ExchangeNotFound(exchange.to_string()))?
                .iter()
                .cloned()
                .collect()
        };

        if let Some(full) = targets
            .iter()
            .find(|name| state.queues.get(*name).is_some_and(Queue::is_full))
        {
            return Err(Error::Backpressure(format!("queue '{}' is full", full)));
        }

        let message = Message {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            properties,
            body,
            redelivered: false,
        };
        for name in &targets {
            if let Some(queue) = state.queues.get_mut(name) {
                queue.ready.push_back(message.clone());
            }
        }
        for name in &targets {
            state.dispatch(name);
        }
        Ok(())
    }

    /// Attach a consumer; deliveries go to `tx`. An empty tag is generated.
    pub fn consume(
        &self,
        channel: ChannelId,
        queue: &str,
        consumer_tag: &str,
        no_ack: bool,
        tx: mpsc::UnboundedSender<Delivery>,
    ) -> Result<String> {
        let mut state = self.lock();
        let prefetch = state.channel(channel)?.prefetch;

        let tag = if consumer_tag.is_empty() {
            generate_consumer_tag()
        } else {
            consumer_tag.to_string()
        };

        let q = state
            .queues
            .get_mut(queue)
            .ok_or_else(|| Error::QueueNotFound(queue.to_string()))?;
        q.check_access(queue, channel)?;
        if q.consumers.iter().any(|c| c.tag == tag) {
            return Err(Error::Broker(format!("duplicate consumer tag '{}'", tag)));
        }
        q.consumers.push(Consumer {
            tag: tag.clone(),
            channel,
            no_ack,
            prefetch,
            in_flight: 0,
            tx,
        });
        q.had_consumer = true;

        state.dispatch(queue);
        Ok(tag)
    }

    /// Detach a consumer. Its unacked deliveries stay pending on the channel.
    pub fn cancel(&self, channel: ChannelId, consumer_tag: &str) -> Result<()> {
        let mut state = self.lock();
        state.channel(channel)?;

        let found = state.queues.iter_mut().find_map(|(name, q)| {
            let pos = q
                .consumers
                .iter()
                .position(|c| c.tag == consumer_tag && c.channel == channel)?;
            q.consumers.remove(pos);
            q.cursor = 0;
            Some(name.clone())
        });

        if let Some(name) = found {
            let auto_delete = state
                .queues
                .get(&name)
                .is_some_and(|q| q.should_auto_delete());
            if auto_delete {
                state.remove_queue(&name);
            }
        }
        Ok(())
    }

    pub fn ack(&self, channel: ChannelId, delivery_tag: DeliveryTag) -> Result<()> {
        let mut state = self.lock();
        let unacked = Self::take_unacked(&mut state, channel, delivery_tag)?;
        state.release_in_flight(&unacked.queue, &unacked.consumer_tag);
        state.dispatch(&unacked.queue);
        Ok(())
    }

    /// Reject a delivery. With `requeue` it goes back to the head of its
    /// queue flagged as redelivered; without, it is dropped.
    pub fn nack(&self, channel: ChannelId, delivery_tag: DeliveryTag, requeue: bool) -> Result<()> {
        let mut state = self.lock();
        let unacked = Self::take_unacked(&mut state, channel, delivery_tag)?;
        state.release_in_flight(&unacked.queue, &unacked.consumer_tag);
        if requeue {
            if let Some(queue) = state.queues.get_mut(&unacked.queue) {
                let mut message = unacked.message;
                message.redelivered = true;
                queue.ready.push_front(message);
            }
        }
        state.dispatch(&unacked.queue);
        Ok(())
    }

    fn take_unacked(
        state: &mut BrokerState,
        channel: ChannelId,
        delivery_tag: DeliveryTag,
    ) -> Result<Unacked> {
        state.channel(channel)?;
        match state.unacked.get(&delivery_tag) {
            Some(u) if u.channel == channel => {}
            _ => return Err(Error::UnknownDeliveryTag(delivery_tag)),
        }
        state
            .unacked
            .remove(&delivery_tag)
            .ok_or(Error::UnknownDeliveryTag(delivery_tag))
    }

    /// Ready (not yet delivered) messages in a queue
    pub fn queue_len(&self, name: &str) -> Option<usize> {
        self.lock().queues.get(name).map(|q| q.ready.len())
    }

    pub fn queue_exists(&self, name: &str) -> bool {
        self.lock().queues.contains_key(name)
    }

    pub fn consumer_count(&self, name: &str) -> usize {
        self.lock()
            .queues
            .get(name)
            .map(|q| q.consumers.len())
            .unwrap_or(0)
    }

    pub fn unacked_count(&self) -> usize {
        self.lock().unacked.len()
    }
}
