// # Two-Tier Caching
//
// A process-local bounded table (LRU + TTL + background GC) layered over the
// shared KV store, with version-token list invalidation and write-through
// semantics.
//
// - `table`: the bounded in-process store
// - `keys`: the wire-observable keyspace and the single truncation rule
// - `local` / `remote`: record and versioned-list tiers over table / KV pool
// - `tiered`: the composition the rest of the service talks to
//
// Invalidating a list never enumerates keys: each entity carries a monotonic
// version token folded into its list keys, and bumping the token orphans
// every previous generation. The periodic GC reaps the orphans.

pub mod keys;
pub mod local;
pub mod remote;
pub mod table;
pub mod tiered;

pub use local::LocalCache;
pub use remote::RemoteCache;
pub use table::{BoundedTable, TableRow, TableStats};
pub use tiered::{CacheTier, TwoTierCache};

pub(crate) use table::now_secs;
