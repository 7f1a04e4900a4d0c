// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Channel Management
//!
//! This module handles the creation and management of AMQP connections and channels
//! through lapin. It provides the `Connector` used against a real RabbitMQ server
//! and the channel wrapper that publishes requests and consumes replies.

use crate::{
    broker::{BrokerChannel, Connector, DeliveryStream, LifecycleEvent, LifecycleSender},
    configs::RabbitMQConfigs,
    errors::AmqpError,
    message::{Acknowledger, InboundDelivery, OutboundMessage, JSON_CONTENT_TYPE},
    queue::QueueDefinition,
};
use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::{
    acker::Acker,
    message::Delivery,
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions,
        BasicQosOptions, QueueDeclareOptions,
    },
    types::{AMQPValue, FieldTable, LongString, ShortString},
    BasicProperties, Channel, Connection, ConnectionProperties,
};
use std::{collections::BTreeMap, future::Future, sync::Arc, time::Duration};
use tracing::{debug, error};
use uuid::Uuid;

const PERSISTENT_DELIVERY_MODE: u8 = 2;
const REPLY_SUCCESS: u16 = 200;

/// Opens lapin connections using the client configuration.
pub struct LapinConnector {
    uri: String,
    connection_name: String,
    prefetch: Option<u16>,
}

impl LapinConnector {
    pub fn new(cfg: &RabbitMQConfigs) -> LapinConnector {
        LapinConnector {
            uri: cfg.uri(),
            connection_name: cfg.app_name.clone(),
            prefetch: cfg.prefetch,
        }
    }
}

#[async_trait]
impl Connector for LapinConnector {
    async fn connect(
        &self,
        generation: u64,
        events: LifecycleSender,
    ) -> Result<Arc<dyn BrokerChannel>, AmqpError> {
        let (conn, channel) = new_amqp_channel(&self.uri, &self.connection_name).await?;

        let conn_events = events.clone();
        conn.on_error(move |err| {
            error!(error = err.to_string(), "amqp connection error");
            let _ = conn_events.send(LifecycleEvent::ConnectionLost {
                generation,
                reason: err.to_string(),
            });
        });

        channel.on_error(move |err| {
            error!(error = err.to_string(), "amqp channel error");
            let _ = events.send(LifecycleEvent::ChannelLost {
                generation,
                reason: err.to_string(),
            });
        });

        Ok(Arc::new(LapinChannel {
            generation,
            connection: conn,
            channel,
            prefetch: self.prefetch,
        }))
    }
}

/// Creates a new AMQP connection and a channel on it.
///
/// # Parameters
/// * `uri` - AMQP URI including credentials, vhost and heartbeat
/// * `connection_name` - Name shown for the connection in the broker
///
/// # Returns
/// A tuple containing the connection and channel on success, or an error on failure.
pub async fn new_amqp_channel(
    uri: &str,
    connection_name: &str,
) -> Result<(Arc<Connection>, Arc<Channel>), AmqpError> {
    debug!("creating amqp connection...");
    let options = ConnectionProperties::default()
        .with_connection_name(LongString::from(connection_name.to_owned()));

    let conn = match Connection::connect(uri, options).await {
        Ok(c) => Ok(c),
        Err(err) => {
            error!(error = err.to_string(), "failure to connect");
            Err(AmqpError::ConnectionError(err.to_string()))
        }
    }?;
    debug!("amqp connected");

    debug!("creating amqp channel...");
    match conn.create_channel().await {
        Ok(c) => {
            debug!("channel created");
            Ok((Arc::new(conn), Arc::new(c)))
        }
        Err(err) => {
            error!(error = err.to_string(), "error to create the channel");
            if let Err(close_err) = conn.close(REPLY_SUCCESS, "channel creation failed").await {
                debug!(error = close_err.to_string(), "failure to close connection");
            }
            Err(AmqpError::ChannelError(err.to_string()))
        }
    }
}

struct LapinChannel {
    generation: u64,
    connection: Arc<Connection>,
    channel: Arc<Channel>,
    prefetch: Option<u16>,
}

#[async_trait]
impl BrokerChannel for LapinChannel {
    fn generation(&self) -> u64 {
        self.generation
    }

    fn is_open(&self) -> bool {
        self.connection.status().connected() && self.channel.status().connected()
    }

    async fn declare_queue(&self, def: &QueueDefinition) -> Result<(), AmqpError> {
        match self
            .channel
            .queue_declare(&def.name, declare_options(def), FieldTable::default())
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), queue = %def.name, "failure to declare queue");
                Err(AmqpError::DeclareQueueError(def.name.clone()))
            }
            _ => {
                debug!(queue = %def.name, "queue declared");
                Ok(())
            }
        }
    }

    async fn publish(&self, msg: &OutboundMessage) -> Result<(), AmqpError> {
        match self
            .channel
            .basic_publish(
                "",
                &msg.routing_key,
                BasicPublishOptions {
                    immediate: false,
                    mandatory: false,
                },
                &msg.payload,
                properties(msg),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error publishing message");
                Err(AmqpError::PublishingError(err.to_string()))
            }
            _ => Ok(()),
        }
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream, AmqpError> {
        if let Some(prefetch) = self.prefetch {
            if let Err(err) = self
                .channel
                .basic_qos(prefetch, BasicQosOptions { global: false })
                .await
            {
                error!(error = err.to_string(), "failure to configure qos");
                return Err(AmqpError::QoSDeclarationError(err.to_string()));
            }
        }

        let consumer = match self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions {
                    no_local: false,
                    no_ack: false,
                    exclusive: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error to create the consumer");
                Err(AmqpError::BindingConsumerError(consumer_tag.to_owned()))
            }
            Ok(c) => Ok(c),
        }?;

        Ok(consumer
            .map(|result| {
                result
                    .map(into_inbound)
                    .map_err(|err| AmqpError::ConsumerError(err.to_string()))
            })
            .boxed())
    }

    async fn close(&self) -> Result<(), AmqpError> {
        let channel = async {
            if !self.channel.status().connected() {
                return Ok(());
            }
            self.channel.close(REPLY_SUCCESS, "OK").await.map_err(|err| {
                error!(error = err.to_string(), "failure to close channel");
                AmqpError::ChannelError(err.to_string())
            })
        };

        let connection = async {
            if !self.connection.status().connected() {
                return Ok(());
            }
            self.connection.close(REPLY_SUCCESS, "OK").await.map_err(|err| {
                error!(error = err.to_string(), "failure to close connection");
                AmqpError::ConnectionError(err.to_string())
            })
        };

        release(channel, connection).await?;
        debug!("amqp channel and connection closed");
        Ok(())
    }
}

/// Closes the channel, then the connection even when the channel close failed.
/// Reports the first failure.
async fn release<C, K>(channel: C, connection: K) -> Result<(), AmqpError>
where
    C: Future<Output = Result<(), AmqpError>>,
    K: Future<Output = Result<(), AmqpError>>,
{
    let channel_closed = channel.await;
    let connection_closed = connection.await;
    channel_closed.and(connection_closed)
}

fn declare_options(def: &QueueDefinition) -> QueueDeclareOptions {
    QueueDeclareOptions {
        durable: def.durable,
        auto_delete: def.delete,
        ..QueueDeclareOptions::default()
    }
}

struct LapinAcker(Acker);

#[async_trait]
impl Acknowledger for LapinAcker {
    async fn ack(&self) -> Result<(), AmqpError> {
        self.0
            .ack(BasicAckOptions { multiple: false })
            .await
            .map(|_| ())
            .map_err(|err| {
                error!(error = err.to_string(), "error whiling ack msg");
                AmqpError::AckMessageError
            })
    }

    async fn nack(&self, requeue: bool) -> Result<(), AmqpError> {
        self.0
            .nack(BasicNackOptions {
                multiple: false,
                requeue,
            })
            .await
            .map(|_| ())
            .map_err(|err| {
                error!(error = err.to_string(), "error whiling nack msg");
                AmqpError::RequeuingMessageError
            })
    }
}

fn properties(msg: &OutboundMessage) -> BasicProperties {
    let headers: BTreeMap<ShortString, AMQPValue> = msg
        .headers
        .iter()
        .map(|(k, v)| {
            (
                ShortString::from(k.clone()),
                AMQPValue::LongString(LongString::from(v.clone())),
            )
        })
        .collect();

    let mut props = BasicProperties::default()
        .with_content_type(ShortString::from(JSON_CONTENT_TYPE))
        .with_message_id(ShortString::from(Uuid::new_v4().to_string()))
        .with_headers(FieldTable::from(headers));

    if msg.persistent {
        props = props.with_delivery_mode(PERSISTENT_DELIVERY_MODE);
    }
    if let Some(id) = &msg.correlation_id {
        props = props.with_correlation_id(ShortString::from(id.clone()));
    }
    if let Some(reply_to) = &msg.reply_to {
        props = props.with_reply_to(ShortString::from(reply_to.clone()));
    }
    if let Some(ttl) = msg.expiration {
        props = props.with_expiration(ShortString::from(ttl.as_millis().to_string()));
    }

    props
}

fn into_inbound(delivery: Delivery) -> InboundDelivery {
    let props = &delivery.properties;

    let headers = props
        .headers()
        .as_ref()
        .map(|table| {
            table
                .inner()
                .iter()
                .filter_map(|(key, value)| match value {
                    AMQPValue::LongString(v) => std::str::from_utf8(v.as_bytes())
                        .ok()
                        .map(|v| (key.to_string(), v.to_owned())),
                    AMQPValue::ShortString(v) => Some((key.to_string(), v.to_string())),
                    _ => None,
                })
                .collect()
        })
        .unwrap_or_default();

    let acker = Box::new(LapinAcker(delivery.acker.clone()));
    let mut inbound = InboundDelivery::new(delivery.data.clone(), acker);
    inbound.correlation_id = props.correlation_id().as_ref().map(|v| v.to_string());
    inbound.reply_to = props.reply_to().as_ref().map(|v| v.to_string());
    inbound.persistent = *props.delivery_mode() == Some(PERSISTENT_DELIVERY_MODE);
    inbound.expiration = props
        .expiration()
        .as_ref()
        .and_then(|v| v.as_str().parse::<u64>().ok())
        .map(Duration::from_millis);
    inbound.headers = headers;
    inbound.redelivered = delivery.redelivered;
    inbound
}
