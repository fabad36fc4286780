use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        pub struct $name(pub i64);

        impl $name {
            pub fn as_i64(self) -> i64 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<i64> for $name {
            fn from(id: i64) -> Self {
                Self(id)
            }
        }
    };
}

id_newtype!(JobId);
id_newtype!(ClusterId);
id_newtype!(RemoteJobId);
id_newtype!(WorkflowId);

/// Workflow step names are unique within a workflow but not globally;
/// the graph utility treats them as opaque hashable node ids, same as
/// job ids, just string-keyed instead of integer-keyed.
pub type StepName = String;
