use sea_orm::{
    ActiveValue, ColumnTrait, Database, DatabaseConnection, DbErr, EntityTrait, QueryFilter,
    QueryOrder, QuerySelect,
};

use lmbridge_core::monitoring::RequestRecord;

use crate::entities::requests;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Db(#[from] DbErr),
}

/// SQLite-backed request log (`logs/requests.db`).
#[derive(Clone)]
pub struct RequestLogStore {
    db: DatabaseConnection,
}

impl RequestLogStore {
    /// Connect and make sure the table and its indexes exist.
    pub async fn connect(dsn: &str) -> Result<Self, StorageError> {
        let db = Database::connect(dsn).await?;
        db.execute_unprepared(
            "CREATE TABLE IF NOT EXISTS requests (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                request_id TEXT NOT NULL,
                timestamp REAL NOT NULL,
                date TEXT NOT NULL,
                model TEXT NOT NULL,
                status TEXT NOT NULL,
                success INTEGER NOT NULL,
                duration REAL NOT NULL,
                error TEXT,
                mode TEXT,
                session_id TEXT,
                messages_count INTEGER NOT NULL DEFAULT 0,
                input_tokens INTEGER NOT NULL DEFAULT 0,
                output_tokens INTEGER NOT NULL DEFAULT 0,
                total_tokens INTEGER NOT NULL DEFAULT 0,
                input_cost REAL NOT NULL DEFAULT 0,
                output_cost REAL NOT NULL DEFAULT 0,
                total_cost REAL NOT NULL DEFAULT 0,
                currency TEXT
            )",
        )
        .await?;
        for ddl in [
            "CREATE INDEX IF NOT EXISTS idx_requests_date_model ON requests(date, model)",
            "CREATE INDEX IF NOT EXISTS idx_requests_success ON requests(success)",
            "CREATE INDEX IF NOT EXISTS idx_requests_timestamp ON requests(timestamp)",
        ] {
            db.execute_unprepared(ddl).await?;
        }
        Ok(Self { db })
    }

    pub async fn append(&self, record: &RequestRecord) -> Result<(), StorageError> {
        let row = requests::ActiveModel {
            id: ActiveValue::NotSet,
            request_id: ActiveValue::Set(record.request_id.clone()),
            timestamp: ActiveValue::Set(record.timestamp),
            date: ActiveValue::Set(record.date.clone()),
            model: ActiveValue::Set(record.model.clone()),
            status: ActiveValue::Set(record.status.clone()),
            success: ActiveValue::Set(record.success),
            duration: ActiveValue::Set(record.duration),
            error: ActiveValue::Set(record.error.clone()),
            mode: ActiveValue::Set(record.mode.clone()),
            session_id: ActiveValue::Set(record.session_id.clone()),
            messages_count: ActiveValue::Set(record.messages_count),
            input_tokens: ActiveValue::Set(record.input_tokens),
            output_tokens: ActiveValue::Set(record.output_tokens),
            total_tokens: ActiveValue::Set(record.total_tokens),
            input_cost: ActiveValue::Set(record.input_cost),
            output_cost: ActiveValue::Set(record.output_cost),
            total_cost: ActiveValue::Set(record.total_cost),
            currency: ActiveValue::Set(record.currency.clone()),
        };
        requests::Entity::insert(row).exec(&self.db).await?;
        Ok(())
    }

    pub async fn recent(&self, limit: u64) -> Result<Vec<requests::Model>, StorageError> {
        Ok(requests::Entity::find()
            .order_by_desc(requests::Column::Id)
            .limit(limit)
            .all(&self.db)
            .await?)
    }

    pub async fn find_request(
        &self,
        request_id: &str,
    ) -> Result<Option<requests::Model>, StorageError> {
        Ok(requests::Entity::find()
            .filter(requests::Column::RequestId.eq(request_id))
            .order_by_desc(requests::Column::Id)
            .one(&self.db)
            .await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(request_id: &str, success: bool) -> RequestRecord {
        RequestRecord {
            request_id: request_id.to_string(),
            timestamp: 1_700_000_000.0,
            date: "2026-08-01".to_string(),
            model: "m1".to_string(),
            status: if success { "success" } else { "failed" }.to_string(),
            success,
            duration: 1.25,
            error: (!success).then(|| "boom".to_string()),
            mode: Some("direct_chat".to_string()),
            session_id: Some("sess".to_string()),
            messages_count: 2,
            input_tokens: 10,
            output_tokens: 20,
            total_tokens: 30,
            input_cost: 0.001,
            output_cost: 0.002,
            total_cost: 0.003,
            currency: Some("USD".to_string()),
        }
    }

    #[tokio::test]
    async fn append_and_read_back() {
        let store = RequestLogStore::connect("sqlite::memory:").await.unwrap();
        store.append(&record("r1", true)).await.unwrap();
        store.append(&record("r2", false)).await.unwrap();

        let recent = store.recent(10).await.unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].request_id, "r2");

        let found = store.find_request("r1").await.unwrap().unwrap();
        assert!(found.success);
        assert_eq!(found.total_tokens, 30);

        assert!(store.find_request("missing").await.unwrap().is_none());
    }
}
