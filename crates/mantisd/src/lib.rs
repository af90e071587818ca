use color_eyre::eyre::{self, Context as _};
use tokio::task::JoinError;

pub use mantis::Mantis;

mod mantis;
pub mod node;
mod strategy;
pub mod telemetry;

pub(crate) fn flatten_join_result<T>(res: Result<eyre::Result<T>, JoinError>) -> eyre::Result<T> {
    match res {
        Ok(Ok(res)) => Ok(res),
        Ok(Err(e)) => Err(e).wrap_err("task returned with error"),
        Err(e) => Err(e).wrap_err("task panicked"),
    }
}
