// The master owns the pipeline: it walks the numbered steps, splits every
// distributed step into work items and coordinates the servants through three
// shared queues. Servants hold no state between phases beyond their last
// epoch; each phase they are told which task to run, build one prepared pool
// for it and work the Work queue until they consume a stop sentinel.

// Queues are served by one registry process over QUIC. Every host, the
// master included, is just a client of that registry, so a single-machine run
// and a cluster run differ only in `number_servers`.

pub mod aggregate;
pub mod config;
pub mod db;
pub mod digest;
pub mod driver;
pub mod error;
pub mod layout;
pub mod master;
pub mod protocol;
pub mod queue;
pub mod servant;
pub mod steps;
pub mod tools;
