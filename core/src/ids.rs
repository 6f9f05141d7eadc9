use serde::{Deserialize, Serialize};
use sqlx::{Database, Decode, Encode, Type};
use std::{borrow::Borrow, fmt, ops::Deref};

macro_rules! define_id_type {
    ($name:ident) => {
        #[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, PartialOrd, Ord)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            pub fn into_inner(self) -> String {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_owned())
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                self.as_str()
            }
        }

        impl Borrow<str> for $name {
            fn borrow(&self) -> &str {
                self.as_str()
            }
        }

        impl Deref for $name {
            type Target = str;

            fn deref(&self) -> &Self::Target {
                self.as_str()
            }
        }

        impl<DB> Type<DB> for $name
        where
            DB: Database,
            String: Type<DB>,
        {
            fn type_info() -> DB::TypeInfo {
                <String as Type<DB>>::type_info()
            }

            fn compatible(ty: &DB::TypeInfo) -> bool {
                <String as Type<DB>>::compatible(ty)
            }
        }

        impl<'q, DB> Encode<'q, DB> for $name
        where
            DB: Database,
            String: Encode<'q, DB>,
        {
            fn encode_by_ref(
                &self,
                buf: &mut <DB as Database>::ArgumentBuffer<'q>,
            ) -> std::result::Result<sqlx::encode::IsNull, sqlx::error::BoxDynError> {
                let owned: String = self.as_str().to_owned();
                owned.encode_by_ref(buf)
            }
        }

        impl<'r, DB> Decode<'r, DB> for $name
        where
            DB: Database,
            String: Decode<'r, DB>,
        {
            fn decode(
                value: <DB as Database>::ValueRef<'r>,
            ) -> std::result::Result<Self, sqlx::error::BoxDynError> {
                let inner = <String as Decode<DB>>::decode(value)?;
                Ok(Self::from(inner))
            }
        }
    };
}

define_id_type!(WorkspaceId);
define_id_type!(DocId);

/// Partition key for update records and snapshots.
///
/// Keys are only ever compared within the same workspace; the workspace id is
/// part of the key so two documents with the same id in different workspaces
/// never share a log or a snapshot.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, PartialOrd, Ord)]
pub struct DocumentGroupKey {
    pub workspace_id: WorkspaceId,
    pub doc_id: DocId,
}

impl DocumentGroupKey {
    pub fn new(workspace_id: impl Into<WorkspaceId>, doc_id: impl Into<DocId>) -> Self {
        Self {
            workspace_id: workspace_id.into(),
            doc_id: doc_id.into(),
        }
    }
}

impl fmt::Display for DocumentGroupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.workspace_id, self.doc_id)
    }
}

impl<W, D> From<(W, D)> for DocumentGroupKey
where
    W: Into<WorkspaceId>,
    D: Into<DocId>,
{
    fn from((workspace_id, doc_id): (W, D)) -> Self {
        Self::new(workspace_id, doc_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn group_key_displays_workspace_then_doc() {
        let key = DocumentGroupKey::new("ws-1", "doc-1");
        assert_eq!(key.to_string(), "ws-1/doc-1");
    }

    #[test]
    fn group_keys_differ_across_workspaces() {
        let a = DocumentGroupKey::from(("ws-1", "doc"));
        let b = DocumentGroupKey::from(("ws-2", "doc"));
        assert_ne!(a, b);
        assert_eq!(a.doc_id, b.doc_id);
    }
}
