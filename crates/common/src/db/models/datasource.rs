//! Datasource entity

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "datasources")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false, column_type = "Text")]
    pub id: String,

    #[sea_orm(column_type = "Text", indexed)]
    pub user_id: String,

    #[sea_orm(column_type = "Text")]
    pub name: String,

    /// Driver kind (`postgres`, `mysql`, `snowflake`, `test`)
    #[sea_orm(column_name = "type", column_type = "Text")]
    pub kind: String,

    #[sea_orm(column_type = "Text")]
    pub options: String,

    pub created_at: DateTimeWithTimeZone,

    pub updated_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
