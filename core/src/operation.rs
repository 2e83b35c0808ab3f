//! The admin framework's data operations as a trait and as a closed enum.

use async_trait::async_trait;
use tracing::debug;

use crate::error::{ApiError, Result};
use crate::types::{ListParams, ListResult, Record, RecordId};

/// One method per data operation the admin framework issues.
///
/// The bulk operations default to `NotImplemented` so a minimal provider only
/// has to supply single-record access; those defaults never touch the network.
#[async_trait]
pub trait DataProvider: Send + Sync {
    async fn get_list(&self, resource: &str, params: &ListParams) -> Result<ListResult>;

    async fn get_one(&self, resource: &str, id: &RecordId) -> Result<Record>;

    async fn get_many(&self, _resource: &str, _ids: &[RecordId]) -> Result<Vec<Record>> {
        Err(ApiError::NotImplemented("get_many"))
    }

    async fn get_many_reference(
        &self,
        _resource: &str,
        _target: &str,
        _id: &RecordId,
        _params: &ListParams,
    ) -> Result<ListResult> {
        Err(ApiError::NotImplemented("get_many_reference"))
    }

    async fn create(&self, resource: &str, data: &Record) -> Result<Record>;

    async fn update(&self, resource: &str, id: &RecordId, data: &Record) -> Result<Record>;

    async fn update_many(
        &self,
        _resource: &str,
        _ids: &[RecordId],
        _data: &Record,
    ) -> Result<Vec<RecordId>> {
        Err(ApiError::NotImplemented("update_many"))
    }

    async fn delete(&self, resource: &str, id: &RecordId) -> Result<RecordId>;

    async fn delete_many(&self, _resource: &str, _ids: &[RecordId]) -> Result<Vec<RecordId>> {
        Err(ApiError::NotImplemented("delete_many"))
    }
}

/// A single data operation against a named resource.
#[derive(Debug, Clone, PartialEq)]
pub enum Operation {
    GetList(ListParams),
    GetOne {
        id: RecordId,
    },
    /// Fetched one by one, in order.
    GetMany {
        ids: Vec<RecordId>,
    },
    /// A list filtered on `target = id`, merged into the caller's filter.
    GetManyReference {
        target: String,
        id: RecordId,
        params: ListParams,
    },
    Create {
        data: Record,
    },
    Update {
        id: RecordId,
        data: Record,
    },
    UpdateMany {
        ids: Vec<RecordId>,
        data: Record,
    },
    Delete {
        id: RecordId,
    },
    DeleteMany {
        ids: Vec<RecordId>,
    },
}

impl Operation {
    pub fn name(&self) -> &'static str {
        match self {
            Operation::GetList(_) => "get_list",
            Operation::GetOne { .. } => "get_one",
            Operation::GetMany { .. } => "get_many",
            Operation::GetManyReference { .. } => "get_many_reference",
            Operation::Create { .. } => "create",
            Operation::Update { .. } => "update",
            Operation::UpdateMany { .. } => "update_many",
            Operation::Delete { .. } => "delete",
            Operation::DeleteMany { .. } => "delete_many",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum OperationResult {
    List(ListResult),
    One(Record),
    Many(Vec<Record>),
    Id(RecordId),
    Ids(Vec<RecordId>),
}

/// Dispatches an operation to the matching provider method.
pub async fn execute<P>(
    provider: &P,
    resource: &str,
    operation: Operation,
) -> Result<OperationResult>
where
    P: DataProvider + ?Sized,
{
    debug!(operation = operation.name(), resource, "executing");
    let result = match operation {
        Operation::GetList(params) => {
            OperationResult::List(provider.get_list(resource, &params).await?)
        }
        Operation::GetOne { id } => OperationResult::One(provider.get_one(resource, &id).await?),
        Operation::GetMany { ids } => {
            OperationResult::Many(provider.get_many(resource, &ids).await?)
        }
        Operation::GetManyReference { target, id, params } => OperationResult::List(
            provider
                .get_many_reference(resource, &target, &id, &params)
                .await?,
        ),
        Operation::Create { data } => {
            OperationResult::One(provider.create(resource, &data).await?)
        }
        Operation::Update { id, data } => {
            OperationResult::One(provider.update(resource, &id, &data).await?)
        }
        Operation::UpdateMany { ids, data } => {
            OperationResult::Ids(provider.update_many(resource, &ids, &data).await?)
        }
        Operation::Delete { id } => OperationResult::Id(provider.delete(resource, &id).await?),
        Operation::DeleteMany { ids } => {
            OperationResult::Ids(provider.delete_many(resource, &ids).await?)
        }
    };
    Ok(result)
}
