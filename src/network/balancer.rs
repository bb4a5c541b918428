//! Moves handlers between I/O threads of one pool to even out load.

use mio::Token;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, trace};

use crate::network::io_thread::{HandlerShared, IoThreadHandle};

/// A migration started by [`IoBalancer::rebalance`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Migration {
    pub token: Token,
    pub from: String,
    pub to: String,
    pub load: u64,
}

/// Load is the number of events a handler processed since the previous
/// rebalance. The busiest thread hands one handler to the idlest thread,
/// picking the heaviest handler whose move still narrows the gap.
#[derive(Debug)]
pub struct IoBalancer {
    threads: Vec<IoThreadHandle>,
    last_event_counts: HashMap<Token, u64>,
    migrations: u64,
}

impl IoBalancer {
    pub fn new(threads: Vec<IoThreadHandle>) -> Self {
        Self {
            threads,
            last_event_counts: HashMap::new(),
            migrations: 0,
        }
    }

    pub fn migration_count(&self) -> u64 {
        self.migrations
    }

    /// Run one balancing round over `handlers`, which must all belong to this pool.
    pub fn rebalance(&mut self, handlers: &[Arc<HandlerShared>]) -> Option<Migration> {
        let mut loads = vec![0u64; self.threads.len()];
        let mut per_thread: Vec<Vec<(&Arc<HandlerShared>, u64)>> = vec![Vec::new(); self.threads.len()];
        let mut seen = HashMap::with_capacity(handlers.len());

        for handler in handlers {
            let count = handler.event_count();
            let previous = self.last_event_counts.get(&handler.token()).copied().unwrap_or(0);
            let delta = count.saturating_sub(previous);
            seen.insert(handler.token(), count);

            let owner = handler.owner();
            if let Some(index) = self.threads.iter().position(|t| *t == owner) {
                loads[index] += delta;
                per_thread[index].push((handler, delta));
            }
        }
        self.last_event_counts = seen;

        if self.threads.len() < 2 {
            return None;
        }

        let (max_index, max_load) = loads.iter().copied().enumerate().max_by_key(|(_, l)| *l)?;
        let (min_index, min_load) = loads.iter().copied().enumerate().min_by_key(|(_, l)| *l)?;
        let gap = max_load - min_load;
        trace!(?loads, gap, "I/O load");
        if max_index == min_index || gap == 0 {
            return None;
        }

        let (handler, load) = per_thread[max_index]
            .iter()
            .filter(|(_, load)| *load > 0 && *load < gap)
            .max_by_key(|(_, load)| *load)?;

        let from = self.threads[max_index].clone();
        let to = self.threads[min_index].clone();
        debug!(
            token = handler.token().0,
            from = %from.name(),
            to = %to.name(),
            load,
            "rebalancing handler"
        );
        handler.request_migration(to.clone());
        self.migrations += 1;

        Some(Migration {
            token: handler.token(),
            from: from.name().to_string(),
            to: to.name().to_string(),
            load: *load,
        })
    }
}
