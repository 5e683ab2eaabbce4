use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use aws_sdk_apigatewaymanagement::primitives::Blob;
use aws_sdk_dynamodb::error::SdkError;
use aws_sdk_dynamodb::operation::update_item::UpdateItemError;
use aws_sdk_dynamodb::types::{AttributeValue, ReturnValue};
use bus_stream_lambda::adapters::connections::{Connection, ConnectionRegistry, RegistryError};
use bus_stream_lambda::adapters::transport::{DeliveryError, Transport};
use bus_stream_lambda::gateway::{is_sqs_event, Gateway, CONNECTION_TTL_SECS};
use chrono::{TimeZone, Utc};
use lambda_runtime::{service_fn, Error, LambdaEvent};
use serde_json::{json, Value};

struct DynamoDbConnectionRegistry {
    client: aws_sdk_dynamodb::Client,
    table: String,
}

fn backend_error(error: impl std::fmt::Display) -> RegistryError {
    RegistryError::Backend(error.to_string())
}

fn connection_item(connection: &Connection) -> HashMap<String, AttributeValue> {
    let mut item = HashMap::from([
        (
            "connection_id".to_string(),
            AttributeValue::S(connection.connection_id.clone()),
        ),
        (
            "connected_at".to_string(),
            AttributeValue::N(connection.connected_at.timestamp_millis().to_string()),
        ),
        (
            "ttl".to_string(),
            AttributeValue::N(connection.expires_at.timestamp().to_string()),
        ),
    ]);
    // DynamoDB rejects empty string sets.
    if !connection.subscribed_lines.is_empty() {
        item.insert(
            "subscribed_lines".to_string(),
            AttributeValue::Ss(connection.subscribed_lines.iter().cloned().collect()),
        );
    }
    item
}

/// A failed `attribute_exists` condition means the connection is gone.
fn update_error(connection_id: &str, error: SdkError<UpdateItemError>) -> RegistryError {
    let missing = error
        .as_service_error()
        .map(|service| service.is_conditional_check_failed_exception())
        .unwrap_or(false);
    if missing {
        RegistryError::NotFound(connection_id.to_string())
    } else {
        backend_error(error)
    }
}

fn subscribed_lines(item: Option<&HashMap<String, AttributeValue>>) -> BTreeSet<String> {
    item.and_then(|item| item.get("subscribed_lines"))
        .and_then(|value| value.as_ss().ok())
        .map(|lines| lines.iter().cloned().collect())
        .unwrap_or_default()
}

impl DynamoDbConnectionRegistry {
    /// Applies a set `ADD` or `DELETE` server-side so concurrent updates compose.
    async fn modify_lines(
        &self,
        connection_id: &str,
        action: &str,
        lines: &BTreeSet<String>,
    ) -> Result<BTreeSet<String>, RegistryError> {
        // DynamoDB rejects empty set operands.
        if lines.is_empty() {
            return self
                .get(connection_id)
                .await?
                .map(|connection| connection.subscribed_lines)
                .ok_or_else(|| RegistryError::NotFound(connection_id.to_string()));
        }
        let output = self
            .client
            .update_item()
            .table_name(&self.table)
            .key("connection_id", AttributeValue::S(connection_id.to_string()))
            .condition_expression("attribute_exists(connection_id) AND #ttl > :now")
            .update_expression(format!("{action} subscribed_lines :lines"))
            .expression_attribute_names("#ttl", "ttl")
            .expression_attribute_values(":lines", AttributeValue::Ss(lines.iter().cloned().collect()))
            .expression_attribute_values(":now", AttributeValue::N(Utc::now().timestamp().to_string()))
            .return_values(ReturnValue::AllNew)
            .send()
            .await
            .map_err(|error| update_error(connection_id, error))?;
        Ok(subscribed_lines(output.attributes()))
    }
}

fn number_attribute(item: &HashMap<String, AttributeValue>, name: &str) -> Option<i64> {
    item.get(name)
        .and_then(|value| value.as_n().ok())
        .and_then(|value| value.parse().ok())
}

fn item_to_connection(item: &HashMap<String, AttributeValue>) -> Option<Connection> {
    let connection_id = item.get("connection_id")?.as_s().ok()?.clone();
    let connected_at = Utc
        .timestamp_millis_opt(number_attribute(item, "connected_at")?)
        .single()?;
    let expires_at = Utc.timestamp_opt(number_attribute(item, "ttl")?, 0).single()?;
    let subscribed_lines = subscribed_lines(Some(item));
    Some(Connection {
        connection_id,
        connected_at,
        subscribed_lines,
        expires_at,
    })
}

#[async_trait]
impl ConnectionRegistry for DynamoDbConnectionRegistry {
    async fn put(&self, connection: Connection) -> Result<(), RegistryError> {
        self.client
            .put_item()
            .table_name(&self.table)
            .set_item(Some(connection_item(&connection)))
            .send()
            .await
            .map(|_| ())
            .map_err(backend_error)
    }

    async fn get(&self, connection_id: &str) -> Result<Option<Connection>, RegistryError> {
        let output = self
            .client
            .get_item()
            .table_name(&self.table)
            .key("connection_id", AttributeValue::S(connection_id.to_string()))
            .consistent_read(true)
            .send()
            .await
            .map_err(backend_error)?;
        let now = Utc::now();
        Ok(output
            .item()
            .and_then(item_to_connection)
            .filter(|connection| !connection.is_expired(now)))
    }

    async fn delete(&self, connection_id: &str) -> Result<(), RegistryError> {
        self.client
            .delete_item()
            .table_name(&self.table)
            .key("connection_id", AttributeValue::S(connection_id.to_string()))
            .send()
            .await
            .map(|_| ())
            .map_err(backend_error)
    }

    async fn update_subscriptions(
        &self,
        connection_id: &str,
        lines: &BTreeSet<String>,
    ) -> Result<(), RegistryError> {
        let request = self
            .client
            .update_item()
            .table_name(&self.table)
            .key("connection_id", AttributeValue::S(connection_id.to_string()))
            .condition_expression("attribute_exists(connection_id)");
        let request = if lines.is_empty() {
            request.update_expression("REMOVE subscribed_lines")
        } else {
            request
                .update_expression("SET subscribed_lines = :lines")
                .expression_attribute_values(
                    ":lines",
                    AttributeValue::Ss(lines.iter().cloned().collect()),
                )
        };
        request
            .send()
            .await
            .map(|_| ())
            .map_err(|error| update_error(connection_id, error))
    }

    async fn add_subscriptions(
        &self,
        connection_id: &str,
        lines: &BTreeSet<String>,
    ) -> Result<BTreeSet<String>, RegistryError> {
        self.modify_lines(connection_id, "ADD", lines).await
    }

    async fn remove_subscriptions(
        &self,
        connection_id: &str,
        lines: &BTreeSet<String>,
    ) -> Result<BTreeSet<String>, RegistryError> {
        self.modify_lines(connection_id, "DELETE", lines).await
    }

    async fn scan_by_subscribed_line(&self, line_id: &str) -> Result<Vec<String>, RegistryError> {
        let now_secs = Utc::now().timestamp();
        let mut connection_ids = Vec::new();
        let mut start_key = None;
        loop {
            let page = self
                .client
                .scan()
                .table_name(&self.table)
                .filter_expression("contains(subscribed_lines, :line) AND #ttl > :now")
                .expression_attribute_names("#ttl", "ttl")
                .expression_attribute_values(":line", AttributeValue::S(line_id.to_string()))
                .expression_attribute_values(":now", AttributeValue::N(now_secs.to_string()))
                .projection_expression("connection_id")
                .set_exclusive_start_key(start_key)
                .send()
                .await
                .map_err(backend_error)?;
            connection_ids.extend(page.items().iter().filter_map(|item| {
                item.get("connection_id")
                    .and_then(|value| value.as_s().ok())
                    .cloned()
            }));
            match page.last_evaluated_key() {
                Some(key) if !key.is_empty() => start_key = Some(key.clone()),
                _ => break,
            }
        }
        Ok(connection_ids)
    }
}

struct ApiGatewayTransport {
    client: aws_sdk_apigatewaymanagement::Client,
}

#[async_trait]
impl Transport for ApiGatewayTransport {
    async fn deliver(&self, connection_id: &str, payload: &[u8]) -> Result<(), DeliveryError> {
        self.client
            .post_to_connection()
            .connection_id(connection_id)
            .data(Blob::new(payload.to_vec()))
            .send()
            .await
            .map(|_| ())
            .map_err(|error| {
                let gone = error
                    .as_service_error()
                    .map(|service| service.is_gone_exception())
                    .unwrap_or(false);
                if gone {
                    DeliveryError::Gone
                } else {
                    DeliveryError::Other(error.to_string())
                }
            })
    }
}

async fn handle_request(event: LambdaEvent<Value>, gateway: &Gateway) -> Result<Value, Error> {
    if is_sqs_event(&event.payload) {
        let stats = gateway.handle_sqs_batch(&event.payload).await;
        Ok(json!({ "status": "ok", "delivery": stats }))
    } else {
        let response = gateway.handle_websocket(&event.payload, Utc::now()).await;
        serde_json::to_value(response)
            .map_err(|error| Error::from(format!("failed to serialize api response: {error}")))
    }
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let aws_config = aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;
    let table = std::env::var("CONNECTIONS_TABLE")
        .map_err(|_| Error::from("CONNECTIONS_TABLE must be configured"))?;
    let endpoint = std::env::var("WEBSOCKET_API_ENDPOINT")
        .map_err(|_| Error::from("WEBSOCKET_API_ENDPOINT must be configured"))?;
    let ttl_secs = std::env::var("CONNECTION_TTL_SECS")
        .ok()
        .and_then(|value| value.parse::<i64>().ok())
        .filter(|secs| *secs > 0)
        .unwrap_or(CONNECTION_TTL_SECS);

    let registry = DynamoDbConnectionRegistry {
        client: aws_sdk_dynamodb::Client::new(&aws_config),
        table,
    };
    let management_config = aws_sdk_apigatewaymanagement::config::Builder::from(&aws_config)
        .endpoint_url(endpoint)
        .build();
    let transport = ApiGatewayTransport {
        client: aws_sdk_apigatewaymanagement::Client::from_conf(management_config),
    };
    let gateway = Arc::new(
        Gateway::new(Arc::new(registry), Arc::new(transport))
            .with_connection_ttl(chrono::Duration::seconds(ttl_secs)),
    );

    lambda_runtime::run(service_fn(move |event: LambdaEvent<Value>| {
        let gateway = Arc::clone(&gateway);
        async move { handle_request(event, &gateway).await }
    }))
    .await
}
