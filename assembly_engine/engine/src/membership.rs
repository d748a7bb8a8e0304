//! The local credential for one assembly.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::identity::{Me, MeRecord};

/// What the backend issued when the member joined.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssemblyDescriptor {
    pub id: String,
    pub secret: String,
    pub name: String,
}

#[derive(Debug, Clone)]
pub struct Membership {
    pub assembly: AssemblyDescriptor,
    pub me: Arc<Me>,
}

/// Serialized membership as kept in the store.
#[derive(Clone, Serialize, Deserialize)]
pub struct MembershipRecord {
    pub assembly: AssemblyDescriptor,
    pub me: MeRecord,
}

impl Membership {
    /// Join with a freshly generated identity.
    pub fn create(assembly: AssemblyDescriptor, nickname: &str) -> Result<Self> {
        Ok(Membership { assembly, me: Arc::new(Me::generate(nickname)?) })
    }

    pub fn to_record(&self) -> MembershipRecord {
        MembershipRecord { assembly: self.assembly.clone(), me: self.me.to_record() }
    }

    pub fn from_record(record: &MembershipRecord) -> Result<Self> {
        Ok(Membership { assembly: record.assembly.clone(), me: Arc::new(Me::from_record(&record.me)?) })
    }
}
