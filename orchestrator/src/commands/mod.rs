mod cron;
mod dlq;
mod enqueue;
mod queue;
mod shared;

pub(crate) use cron::{cron_check, cron_next};
pub(crate) use dlq::{DlqListOptions, dlq_list};
pub(crate) use enqueue::{EnqueueOptions, enqueue};
pub(crate) use queue::{queue_pending, queue_stats};
