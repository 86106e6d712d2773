//! Documents, queries and batched writes.

use std::cmp::Ordering;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use crate::StoreError;

/// Field map of a document.
pub type Fields = Map<String, Value>;

/// Key the server recognizes as "resolve to the commit time".
const SERVER_TIMESTAMP_KEY: &str = ".sv";

/// Sentinel value that the store replaces with its own clock on commit.
pub fn server_timestamp() -> Value {
    let mut map = Map::new();
    map.insert(SERVER_TIMESTAMP_KEY.to_string(), json!("timestamp"));
    Value::Object(map)
}

/// Check whether a value is the server timestamp sentinel.
pub fn is_server_timestamp(value: &Value) -> bool {
    value
        .as_object()
        .and_then(|m| m.get(SERVER_TIMESTAMP_KEY))
        .and_then(Value::as_str)
        == Some("timestamp")
}

/// A document as returned by a read or a live snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    #[serde(default)]
    pub data: Fields,
}

impl Document {
    pub fn new(id: impl Into<String>, data: Fields) -> Self {
        Self {
            id: id.into(),
            data,
        }
    }

    /// Decode into a typed record. The document id is exposed as the `id` field.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, StoreError> {
        let mut data = self.data.clone();
        data.insert("id".to_string(), Value::String(self.id.clone()));
        Ok(serde_json::from_value(Value::Object(data))?)
    }

    /// Decode every document, dropping the ones that don't fit `T`.
    pub fn decode_all<T: DeserializeOwned>(docs: &[Document]) -> Vec<T> {
        docs.iter()
            .filter_map(|doc| match doc.decode() {
                Ok(value) => Some(value),
                Err(e) => {
                    tracing::warn!(id = %doc.id, error = %e, "skipping undecodable document");
                    None
                }
            })
            .collect()
    }
}

/// Encode a record as a field map, dropping its `id` (ids live outside the data).
pub fn to_fields<T: Serialize>(record: &T) -> Result<Fields, StoreError> {
    match serde_json::to_value(record)? {
        Value::Object(mut map) => {
            map.remove("id");
            Ok(map)
        }
        other => Err(StoreError::InvalidRequest(format!(
            "expected an object, got {}",
            other
        ))),
    }
}

/// Sort direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Asc,
    Desc,
}

/// Ordering clause.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderBy {
    pub field: String,
    pub direction: Direction,
}

/// Equality filter on a single field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Filter {
    pub field: String,
    pub value: Value,
}

/// A collection query: equality filters, optional ordering and limit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Query {
    pub collection: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub filters: Vec<Filter>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order_by: Option<OrderBy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
}

impl Query {
    /// Query every document of a collection.
    pub fn collection(collection: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            filters: Vec::new(),
            order_by: None,
            limit: None,
        }
    }

    /// Add an equality filter.
    pub fn where_eq(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.filters.push(Filter {
            field: field.into(),
            value: value.into(),
        });
        self
    }

    pub fn order_by(mut self, field: impl Into<String>, direction: Direction) -> Self {
        self.order_by = Some(OrderBy {
            field: field.into(),
            direction,
        });
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Check whether a document passes every filter.
    pub fn matches(&self, doc: &Document) -> bool {
        self.filters
            .iter()
            .all(|f| doc.data.get(&f.field) == Some(&f.value))
    }

    /// Evaluate the query against a set of documents.
    pub fn evaluate(&self, docs: impl IntoIterator<Item = Document>) -> Vec<Document> {
        let mut out: Vec<Document> = docs.into_iter().filter(|d| self.matches(d)).collect();

        if let Some(order) = &self.order_by {
            out.sort_by(|a, b| {
                let ord = compare_values(a.data.get(&order.field), b.data.get(&order.field))
                    .then_with(|| a.id.cmp(&b.id));
                match order.direction {
                    Direction::Asc => ord,
                    Direction::Desc => ord.reverse(),
                }
            });
        }

        if let Some(limit) = self.limit {
            out.truncate(limit);
        }
        out
    }
}

/// Total order over JSON values used for query ordering. Missing sorts first.
fn compare_values(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(Value::Number(x)), Some(Value::Number(y))) => x
            .as_f64()
            .unwrap_or_default()
            .partial_cmp(&y.as_f64().unwrap_or_default())
            .unwrap_or(Ordering::Equal),
        (Some(Value::String(x)), Some(Value::String(y))) => x.cmp(y),
        (Some(Value::Bool(x)), Some(Value::Bool(y))) => x.cmp(y),
        (Some(x), Some(y)) => x.to_string().cmp(&y.to_string()),
    }
}

/// A single write in a batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum WriteOp {
    Create {
        collection: String,
        id: String,
        data: Fields,
    },
    Update {
        collection: String,
        id: String,
        patch: Fields,
    },
    Delete {
        collection: String,
        id: String,
    },
}

impl WriteOp {
    pub fn collection(&self) -> &str {
        match self {
            WriteOp::Create { collection, .. }
            | WriteOp::Update { collection, .. }
            | WriteOp::Delete { collection, .. } => collection,
        }
    }
}

/// Atomic multi-document write. Either every op commits or none does.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WriteBatch {
    ops: Vec<WriteOp>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a create with a client-generated id. Returns the id.
    pub fn create(&mut self, collection: impl Into<String>, data: Fields) -> String {
        let id = Tid::now().to_string();
        self.ops.push(WriteOp::Create {
            collection: collection.into(),
            id: id.clone(),
            data,
        });
        id
    }

    pub fn update(&mut self, collection: impl Into<String>, id: impl Into<String>, patch: Fields) {
        self.ops.push(WriteOp::Update {
            collection: collection.into(),
            id: id.into(),
            patch,
        });
    }

    pub fn delete(&mut self, collection: impl Into<String>, id: impl Into<String>) {
        self.ops.push(WriteOp::Delete {
            collection: collection.into(),
            id: id.into(),
        });
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn ops(&self) -> &[WriteOp] {
        &self.ops
    }

    pub fn into_ops(self) -> Vec<WriteOp> {
        self.ops
    }
}

/// Last value handed out by [`Tid::now`].
static LAST_TID: AtomicU64 = AtomicU64::new(0);

/// A time-sortable document id.
///
/// 13 characters of base32-sortable encoding: 53 bits of microsecond timestamp
/// followed by 10 bits of clock identifier. Ids are strictly increasing within
/// a process, so lexicographic order matches creation order. More than 1024
/// ids in one microsecond borrow from the following microseconds.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Tid(pub String);

impl Tid {
    pub fn now() -> Self {
        use std::time::{SystemTime, UNIX_EPOCH};

        let micros = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_micros() as u64;
        let floor = micros << 10;

        let next = |last: u64| floor.max(last + 1);
        let last = LAST_TID
            .fetch_update(AtomicOrdering::Relaxed, AtomicOrdering::Relaxed, |last| {
                Some(next(last))
            })
            .unwrap_or_else(|last| last);

        Self::from_u64(next(last))
    }

    fn from_u64(val: u64) -> Self {
        const CHARSET: &[u8] = b"234567abcdefghijklmnopqrstuvwxyz";
        let mut tid = String::with_capacity(13);

        let mut v = val;
        for _ in 0..13 {
            tid.push(CHARSET[(v & 0x1f) as usize] as char);
            v >>= 5;
        }

        Self(tid.chars().rev().collect())
    }
}

impl std::fmt::Display for Tid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(id: &str, created: &str, owner: &str) -> Document {
        let mut data = Fields::new();
        data.insert("createdAt".into(), json!(created));
        data.insert("userId".into(), json!(owner));
        Document::new(id, data)
    }

    #[test]
    fn query_filters_orders_and_limits() {
        let docs = vec![
            doc("a", "2026-01-01T00:00:00Z", "u1"),
            doc("b", "2026-01-03T00:00:00Z", "u1"),
            doc("c", "2026-01-02T00:00:00Z", "u2"),
            doc("d", "2026-01-04T00:00:00Z", "u1"),
        ];

        let query = Query::collection("notifications")
            .where_eq("userId", "u1")
            .order_by("createdAt", Direction::Desc)
            .limit(2);

        let ids: Vec<_> = query.evaluate(docs).into_iter().map(|d| d.id).collect();
        assert_eq!(ids, vec!["d", "b"]);
    }

    #[test]
    fn decode_injects_id() {
        #[derive(Deserialize)]
        struct Named {
            id: String,
            name: String,
        }

        let mut data = Fields::new();
        data.insert("name".into(), json!("Launch"));
        let named: Named = Document::new("p1", data).decode().unwrap();
        assert_eq!(named.id, "p1");
        assert_eq!(named.name, "Launch");
    }

    #[test]
    fn server_timestamp_sentinel_is_recognized() {
        assert!(is_server_timestamp(&server_timestamp()));
        assert!(!is_server_timestamp(&json!("2026-01-01T00:00:00Z")));
        assert!(!is_server_timestamp(&json!({ "other": "timestamp" })));
    }

    #[test]
    fn batch_collects_ops_in_order() {
        let mut batch = WriteBatch::new();
        batch.update("notifications", "n1", Fields::new());
        batch.delete("notifications", "n2");
        assert_eq!(batch.len(), 2);
        assert!(matches!(batch.ops()[1], WriteOp::Delete { .. }));
    }

    #[test]
    fn tids_sort_by_creation() {
        let a = Tid::now();
        let b = Tid::now();
        assert_eq!(a.0.len(), 13);
        assert!(a.0 < b.0);
    }

    #[test]
    fn tids_stay_ordered_past_the_clock_id_range() {
        let tids: Vec<Tid> = (0..5000).map(|_| Tid::now()).collect();
        for pair in tids.windows(2) {
            assert!(pair[0].0 < pair[1].0, "{} !< {}", pair[0], pair[1]);
        }
    }

    #[test]
    fn tids_are_unique_across_threads() {
        let handles: Vec<_> = (0..4)
            .map(|_| std::thread::spawn(|| (0..2000).map(|_| Tid::now()).collect::<Vec<_>>()))
            .collect();
        let mut all: Vec<Tid> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        let total = all.len();
        all.sort_by(|a, b| a.0.cmp(&b.0));
        all.dedup();
        assert_eq!(all.len(), total);
    }
}
