use sea_orm::entity::prelude::*;

/// Append-only request log row, one per terminal request event.
#[sea_orm::model]
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "requests")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    pub request_id: String,
    pub timestamp: f64,
    pub date: String,
    pub model: String,
    pub status: String,
    pub success: bool,
    pub duration: f64,
    pub error: Option<String>,
    pub mode: Option<String>,
    pub session_id: Option<String>,
    pub messages_count: i64,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub total_tokens: i64,
    pub input_cost: f64,
    pub output_cost: f64,
    pub total_cost: f64,
    pub currency: Option<String>,
}

impl ActiveModelBehavior for ActiveModel {}
