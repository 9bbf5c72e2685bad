//! API key entity

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "api_keys")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false, column_type = "Text")]
    pub id: String,

    #[sea_orm(column_type = "Text", indexed)]
    pub user_id: String,

    #[sea_orm(column_type = "Text")]
    pub name: String,

    /// SHA-256 hex digest of the plaintext key
    #[sea_orm(column_name = "key", column_type = "Text", unique)]
    #[serde(skip_serializing)]
    pub key_hash: String,

    #[sea_orm(nullable)]
    pub last_used: Option<DateTimeWithTimeZone>,

    pub created_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
