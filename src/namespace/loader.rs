//! Entity loading strategies.
//!
//! A collection node does not know where its entities come from; it
//! holds a [`Loader`] chosen at tree-construction time. Remote
//! collections load over RPC or from the entity-subscriber replica,
//! nested collections read an array field out of the parent entity.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::rpc::{
    filters_to_wire, EntitySubscriber, FilterEntry, FilterOp, FilterParams, RpcClient, RpcError,
};

#[async_trait]
pub trait Loader: Send + Sync {
    /// Runs a filtered query. `parent` is the working document of the
    /// enclosing item for nested collections, `None` otherwise.
    async fn query(
        &self,
        filter: &[FilterEntry],
        params: &FilterParams,
        parent: Option<&Value>,
    ) -> Result<Vec<Value>, RpcError>;

    async fn get_one(
        &self,
        key_field: &str,
        key: &Value,
        parent: Option<&Value>,
    ) -> Result<Option<Value>, RpcError> {
        let filter = vec![FilterEntry::Cond(
            key_field.to_string(),
            FilterOp::Eq,
            key.clone(),
        )];
        Ok(self
            .query(&filter, &FilterParams::single(), parent)
            .await?
            .into_iter()
            .next())
    }

    /// Collection name in the subscriber replica, when there is one.
    fn collection(&self) -> Option<&str> {
        None
    }
}

/// Loads by calling a remote query method directly.
pub struct RpcLoader {
    client: Arc<dyn RpcClient>,
    method: String,
}

impl RpcLoader {
    pub fn new(client: Arc<dyn RpcClient>, method: &str) -> Self {
        Self {
            client,
            method: method.to_string(),
        }
    }
}

#[async_trait]
impl Loader for RpcLoader {
    async fn query(
        &self,
        filter: &[FilterEntry],
        params: &FilterParams,
        _parent: Option<&Value>,
    ) -> Result<Vec<Value>, RpcError> {
        let result = self
            .client
            .call(&self.method, json!([filters_to_wire(filter), params.to_wire()]))
            .await?;
        match result {
            Value::Array(rows) => Ok(rows),
            Value::Null => Ok(Vec::new()),
            single => Ok(vec![single]),
        }
    }
}

/// Loads from the continuously-updated local replica.
pub struct SubscriberLoader {
    subscriber: Arc<dyn EntitySubscriber>,
    collection: String,
}

impl SubscriberLoader {
    pub fn new(subscriber: Arc<dyn EntitySubscriber>, collection: &str) -> Self {
        Self {
            subscriber,
            collection: collection.to_string(),
        }
    }
}

#[async_trait]
impl Loader for SubscriberLoader {
    async fn query(
        &self,
        filter: &[FilterEntry],
        params: &FilterParams,
        _parent: Option<&Value>,
    ) -> Result<Vec<Value>, RpcError> {
        self.subscriber.query(&self.collection, filter, params).await
    }

    async fn get_one(
        &self,
        _key_field: &str,
        key: &Value,
        _parent: Option<&Value>,
    ) -> Result<Option<Value>, RpcError> {
        let filter = vec![FilterEntry::Cond(
            "id".to_string(),
            FilterOp::Eq,
            key.clone(),
        )];
        self.subscriber.get_one(&self.collection, &filter).await
    }

    fn collection(&self) -> Option<&str> {
        Some(&self.collection)
    }
}

/// Reads entities from an array field of the parent entity, filtering
/// locally.
pub struct NestedLoader {
    field: String,
}

impl NestedLoader {
    pub fn new(field: &str) -> Self {
        Self {
            field: field.to_string(),
        }
    }
}

fn compare(a: &Value, b: &Value) -> Option<std::cmp::Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64().partial_cmp(&y.as_f64()),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

fn matches_entry(doc: &Value, entry: &FilterEntry) -> bool {
    match entry {
        FilterEntry::Cond(field, op, expected) => {
            let actual = doc.get(field).cloned().unwrap_or(Value::Null);
            match op {
                FilterOp::Eq => &actual == expected,
                FilterOp::Ne => &actual != expected,
                FilterOp::Match => match (actual.as_str(), expected.as_str()) {
                    (Some(a), Some(pattern)) => regex::Regex::new(pattern)
                        .map(|re| re.is_match(a))
                        .unwrap_or(false),
                    _ => false,
                },
                FilterOp::Gt => {
                    matches!(compare(&actual, expected), Some(std::cmp::Ordering::Greater))
                }
                FilterOp::Lt => matches!(compare(&actual, expected), Some(std::cmp::Ordering::Less)),
                FilterOp::Ge => matches!(
                    compare(&actual, expected),
                    Some(std::cmp::Ordering::Greater | std::cmp::Ordering::Equal)
                ),
                FilterOp::Le => matches!(
                    compare(&actual, expected),
                    Some(std::cmp::Ordering::Less | std::cmp::Ordering::Equal)
                ),
            }
        }
        FilterEntry::Nor(entries) => !entries.iter().any(|e| matches_entry(doc, e)),
    }
}

/// Applies a compiled query to an in-memory row set, the same way the
/// remote side would.
pub fn apply_filter(rows: Vec<Value>, filter: &[FilterEntry], params: &FilterParams) -> Vec<Value> {
    let mut rows = rows
        .into_iter()
        .filter(|doc| filter.iter().all(|entry| matches_entry(doc, entry)))
        .collect::<Vec<_>>();
    for key in params.sort.iter().rev() {
        let (field, descending) = match key.strip_prefix('-') {
            Some(rest) => (rest, true),
            None => (key.as_str(), false),
        };
        rows.sort_by(|a, b| {
            let ord = compare(
                a.get(field).unwrap_or(&Value::Null),
                b.get(field).unwrap_or(&Value::Null),
            )
            .unwrap_or(std::cmp::Ordering::Equal);
            if descending {
                ord.reverse()
            } else {
                ord
            }
        });
    }
    if let Some(limit) = params.limit {
        rows.truncate(limit as usize);
    }
    rows
}

#[async_trait]
impl Loader for NestedLoader {
    async fn query(
        &self,
        filter: &[FilterEntry],
        params: &FilterParams,
        parent: Option<&Value>,
    ) -> Result<Vec<Value>, RpcError> {
        let rows = parent
            .and_then(|doc| doc.get(&self.field))
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        Ok(apply_filter(rows, filter, params))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn rows() -> Vec<Value> {
        vec![
            json!({"username": "root", "uid": 0}),
            json!({"username": "alice", "uid": 1001}),
            json!({"username": "bob", "uid": 1002}),
        ]
    }

    #[test]
    fn test_apply_filter_cond_and_sort() {
        let filter = vec![FilterEntry::Cond(
            "uid".to_string(),
            FilterOp::Gt,
            json!(1000),
        )];
        let params = FilterParams {
            sort: vec!["-uid".to_string()],
            limit: None,
            single: false,
        };
        let result = apply_filter(rows(), &filter, &params);
        assert_eq!(
            result
                .iter()
                .map(|r| r["username"].as_str().unwrap())
                .collect::<Vec<_>>(),
            vec!["bob", "alice"]
        );
    }

    #[test]
    fn test_apply_filter_nor() {
        let filter = vec![FilterEntry::Nor(vec![FilterEntry::Cond(
            "username".to_string(),
            FilterOp::Eq,
            json!("root"),
        )])];
        let result = apply_filter(rows(), &filter, &FilterParams::default());
        assert_eq!(result.len(), 2);
    }

    #[test]
    fn test_apply_filter_limit() {
        let params = FilterParams {
            sort: vec!["uid".to_string()],
            limit: Some(1),
            single: false,
        };
        let result = apply_filter(rows(), &[], &params);
        assert_eq!(result[0]["username"], json!("root"));
        assert_eq!(result.len(), 1);
    }

    #[tokio::test]
    async fn test_nested_loader_reads_parent_field() {
        let loader = NestedLoader::new("aliases");
        let parent = json!({"aliases": [{"address": "10.0.0.1"}, {"address": "10.0.0.2"}]});
        let result = loader
            .query(&[], &FilterParams::default(), Some(&parent))
            .await
            .unwrap();
        assert_eq!(result.len(), 2);
    }

    #[tokio::test]
    async fn test_rpc_loader_calls_method() {
        use crate::rpc::MockRpcClient;
        let mut client = MockRpcClient::new();
        client
            .expect_call()
            .withf(|method, args| {
                method == "user.query" && args == &json!([[["uid", ">", 1000]], {}])
            })
            .returning(|_, _| Ok(json!([{"username": "alice"}])));
        let loader = RpcLoader::new(Arc::new(client), "user.query");
        let filter = vec![FilterEntry::Cond(
            "uid".to_string(),
            FilterOp::Gt,
            json!(1000),
        )];
        let result = loader
            .query(&filter, &FilterParams::default(), None)
            .await
            .unwrap();
        assert_eq!(result, vec![json!({"username": "alice"})]);
    }
}
