//! overlay-policy: converges the host packet filter onto planner output.
//!
//! ```text
//! Poller (interval, watch shutdown)
//!   └── SinglePollCycle
//!         ├── Planner::get_rules_and_chain()   one at a time, in order
//!         ├── diff against last applied        per chain
//!         └── Enforcer::enforce_rules_and_chain()
//!               └── IpTables (iptables / iptables-restore, or in memory)
//! ```

pub mod converger;
pub mod enforcer;
pub mod error;
pub mod iptables;
pub mod planner;
pub mod poller;
pub mod rules;

pub use converger::{METRIC_ENFORCE_TIME, METRIC_POLL_TIME, SinglePollCycle};
pub use enforcer::{ChainEnforcer, Clock, Enforcer, SystemClock};
pub use error::{CycleError, EnforceError, IptablesError, PlannerError};
pub use iptables::{IpTables, IptablesCommand, MemoryIptables};
pub use planner::{LocalPlanner, LoggingState, Planner, RemotePlanner, StaticPlanner};
pub use poller::Poller;
pub use rules::{Chain, Rule, RuleSet};
