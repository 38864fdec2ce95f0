//! # onionc
//!
//! Query-rewriting core of an encrypted-database front end. Given a
//! resolved SELECT statement against the logical schema and an onion set (a
//! catalog of which encrypted representations exist for each column and
//! precomputed expression), it synthesizes a plan tree whose leaves are
//! rewritten SQL statements evaluated server-side against encrypted
//! storage, and whose interior nodes are client-side operators that finish
//! any work the server cannot perform under the chosen encryption scheme.
//!
//! ```ascii
//!        SELECT stmt
//!
//!   (bind)     │
//!   bind_stmt  │   attach scopes & symbols
//!              ▼
//!      resolved stmt ───────────► generate_onion_sets
//!              │                        │
//!              │   onion set            │  candidate onion sets
//!              ▼                        ▼
//!       generate_plan  ◄──────  generate_candidate_plans
//!              │
//!              ▼
//!          plan tree        RemoteSql leaves + Local* operators
//! ```
//!
//! Plan generation is a pure function of (statement, onion set, enc
//! context) plus read-only schema access; candidate enumeration calls it
//! once per merged onion set, and invocations are independent.

mod codegen;
mod error;
mod utils;

pub mod ast;
pub mod gen;
pub mod onion;
pub mod plan;
pub mod schema;
pub mod scope;

pub use codegen::{SqlFrom, SqlSelect, write_expr, write_select};
pub use error::{Error, Errors, MessageKind, Reason, WithErrorInfo};
pub use gen::{
    EncContext, EstimateContext, generate_candidate_plans, generate_onion_sets, generate_plan,
};

pub type Result<T, E = Error> = core::result::Result<T, E>;
