use std::fmt::{Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

pub type Uid = u32;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClusterId {
    Slurm,
    HtCondor,
}

impl ClusterId {
    pub const ALL: [ClusterId; 2] = [ClusterId::Slurm, ClusterId::HtCondor];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Slurm => "slurm",
            Self::HtCondor => "htcondor",
        }
    }
}

impl Display for ClusterId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct UnknownIdentifier(pub String);

impl FromStr for ClusterId {
    type Err = UnknownIdentifier;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "slurm" => Ok(Self::Slurm),
            "htcondor" => Ok(Self::HtCondor),
            other => Err(UnknownIdentifier(other.to_string())),
        }
    }
}

/// A deployment site; directory layout and credential handling vary per site.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SiteId {
    Ihep,
    Hai,
    Heps,
}

impl SiteId {
    pub const ALL: [SiteId; 3] = [SiteId::Ihep, SiteId::Hai, SiteId::Heps];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ihep => "ihep",
            Self::Hai => "hai",
            Self::Heps => "heps",
        }
    }
}

impl Display for SiteId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SiteId {
    type Err = UnknownIdentifier;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "ihep" => Ok(Self::Ihep),
            "hai" => Ok(Self::Hai),
            "heps" => Ok(Self::Heps),
            other => Err(UnknownIdentifier(other.to_string())),
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum JobOperation {
    Submit,
    Query,
    Cancel,
    ReadOutput,
    BuildEnvironment,
    OpenGateway,
    CloseGateway,
    Connect,
    SweepVanished,
    BackfillTimes,
    Store,
}

impl JobOperation {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Submit => "submit",
            Self::Query => "query",
            Self::Cancel => "cancel",
            Self::ReadOutput => "read_output",
            Self::BuildEnvironment => "build_environment",
            Self::OpenGateway => "open_gateway",
            Self::CloseGateway => "close_gateway",
            Self::Connect => "connect",
            Self::SweepVanished => "sweep_vanished",
            Self::BackfillTimes => "backfill_times",
            Self::Store => "store",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cluster_ids_round_trip_through_strings() {
        for cluster in ClusterId::ALL {
            assert_eq!(cluster.as_str().parse::<ClusterId>(), Ok(cluster));
        }
        assert_eq!(
            "pbs".parse::<ClusterId>(),
            Err(UnknownIdentifier("pbs".to_string()))
        );
    }

    #[test]
    fn site_ids_parse_lowercase_names_only() {
        assert_eq!("heps".parse::<SiteId>(), Ok(SiteId::Heps));
        assert!("IHEP".parse::<SiteId>().is_err());
    }
}
