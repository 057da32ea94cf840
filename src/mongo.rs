//! MongoDB document store.

use crate::error::{Error, Result};
use crate::extract::{CollectionStats, DocumentStore, FindQuery};
use futures_util::TryStreamExt;
use mongodb::bson::{Bson, Document, doc};
use mongodb::options::ClientOptions;
use mongodb::{Client, Database};
use serde_json::{Map, Value as JsonValue};
use std::time::Duration;
use tracing::{debug, info, instrument};

/// MongoDB client bound to one database.
pub struct MongoStore {
    client: Client,
    db: Database,
}

impl MongoStore {
    /// Connect to `uri` and select `db_name`.
    #[instrument(skip(uri), fields(uri = %crate::postgres::mask_url(uri)))]
    pub async fn connect(
        uri: &str,
        db_name: &str,
        server_selection_timeout: Duration,
    ) -> Result<Self> {
        info!("Connecting to MongoDB...");
        let mut options = ClientOptions::parse(uri)
            .await
            .map_err(|e| Error::document_store("", "Invalid connection string", e))?;
        options.server_selection_timeout = Some(server_selection_timeout);
        options.app_name = Some(env!("CARGO_PKG_NAME").to_string());

        let client = Client::with_options(options)
            .map_err(|e| Error::document_store("", "Failed to create client", e))?;
        let db = client.database(db_name);
        Ok(Self { client, db })
    }

    /// Close the client, waiting for in-flight operations.
    pub async fn close(self) {
        self.client.shutdown().await;
    }
}

impl DocumentStore for MongoStore {
    async fn collection_stats(&self, collection: &str) -> Result<CollectionStats> {
        let stats = self
            .db
            .run_command(doc! { "collStats": collection })
            .await
            .map_err(|e| Error::document_store(collection, "collStats failed", e))?;

        Ok(CollectionStats {
            count: bson_u64(stats.get("count")),
            avg_object_size: bson_u64(stats.get("avgObjSize")),
        })
    }

    async fn find(&self, collection: &str, query: &FindQuery) -> Result<Vec<JsonValue>> {
        let filter = to_document(collection, &query.filter)?;
        debug!("find {} filter={}", collection, filter);

        let coll = self.db.collection::<Document>(collection);
        let mut action = coll.find(filter);
        if let Some(projection) = &query.projection {
            action = action.projection(to_document(collection, projection)?);
        }
        if let Some(sort) = &query.sort {
            let mut order = Document::new();
            order.insert(sort.as_str(), 1);
            action = action.sort(order);
        }
        if let Some(skip) = query.skip {
            action = action.skip(skip);
        }
        if let Some(limit) = query.limit {
            action = action.limit(limit as i64);
        }

        let docs: Vec<Document> = action
            .await
            .map_err(|e| Error::document_store(collection, "find failed", e))?
            .try_collect()
            .await
            .map_err(|e| Error::document_store(collection, "cursor failed", e))?;

        Ok(docs
            .into_iter()
            .map(|d| bson_to_json(Bson::Document(d)))
            .collect())
    }
}

fn to_document(collection: &str, map: &Map<String, JsonValue>) -> Result<Document> {
    mongodb::bson::to_document(map)
        .map_err(|e| Error::document_store(collection, "Invalid query document", e))
}

fn bson_u64(value: Option<&Bson>) -> u64 {
    match value {
        Some(Bson::Int32(n)) => (*n).max(0) as u64,
        Some(Bson::Int64(n)) => (*n).max(0) as u64,
        Some(Bson::Double(n)) if n.is_finite() && *n > 0.0 => *n as u64,
        _ => 0,
    }
}

/// Convert a BSON value to plain JSON.
///
/// Object ids become their hex string and dates RFC 3339 strings; everything else uses the
/// relaxed extended JSON form.
pub fn bson_to_json(value: Bson) -> JsonValue {
    match value {
        Bson::ObjectId(oid) => JsonValue::String(oid.to_hex()),
        Bson::DateTime(dt) => match dt.try_to_rfc3339_string() {
            Ok(s) => JsonValue::String(s),
            Err(_) => JsonValue::from(dt.timestamp_millis()),
        },
        Bson::Document(doc) => JsonValue::Object(
            doc.into_iter()
                .map(|(k, v)| (k, bson_to_json(v)))
                .collect(),
        ),
        Bson::Array(items) => JsonValue::Array(items.into_iter().map(bson_to_json).collect()),
        other => other.into_relaxed_extjson(),
    }
}
