//! Target selection.
//!
//! This module decides which backend serves a request:
//! - Candidates are built fresh per request from cluster health, live cluster
//!   cost and cached provider health
//! - A [`RoutingStrategy`] picks one candidate and tags the choice with a
//!   [`RouteReason`]

mod selector;

pub use selector::{
    select, RouteDecision, RouteReason, Router, RoutingStrategy, Target, TargetKind,
};
