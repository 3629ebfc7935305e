// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Data structures and related facilities for representing resources
//!
//! These are the records the orchestrator reads and persists through the data
//! store.  They are transport-agnostic: the HTTP layer that creates clusters
//! converts its own request types into [`ClusterCreate`].

mod cluster;
mod error;
mod progress;

pub use cluster::*;
pub use error::*;
pub use progress::*;

use parse_display::Display;
use parse_display::FromStr;
use serde::Deserialize;
use serde::Serialize;

// The type aliases below exist primarily to ensure consistency among return
// types for functions in the data store and the orchestrator.

/// Result of a create operation for the specified type
pub type CreateResult<T> = Result<T, Error>;
/// Result of a delete operation for the specified type
pub type DeleteResult = Result<(), Error>;
/// Result of a list operation that returns a vector
pub type ListResultVec<T> = Result<Vec<T>, Error>;
/// Result of a lookup operation for the specified type
pub type LookupResult<T> = Result<T, Error>;
/// Result of an update operation for the specified type
pub type UpdateResult<T> = Result<T, Error>;

/// Identifies a type of resource, used in errors
#[derive(
    Clone,
    Copy,
    Debug,
    Deserialize,
    Display,
    Eq,
    FromStr,
    Ord,
    PartialEq,
    PartialOrd,
    Serialize,
)]
#[display(style = "kebab-case")]
pub enum ResourceType {
    Cluster,
    NodeGroup,
    Instance,
    ProvisioningStep,
    Plugin,
    PluginVersion,
    Secret,
    JobExecution,
}

#[cfg(test)]
mod test {
    use super::ResourceType;

    #[test]
    fn test_resource_type_display() {
        assert_eq!(ResourceType::NodeGroup.to_string(), "node-group");
        assert_eq!(
            "provisioning-step".parse::<ResourceType>().unwrap(),
            ResourceType::ProvisioningStep
        );
    }
}
