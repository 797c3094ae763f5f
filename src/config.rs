use std::time::Duration;

use clap::Parser;

use crate::job::WorkerSettings;
use crate::reconcile::Settings;

#[derive(Parser, Debug)]
#[command(name = "controller")]
#[command(about = "Runs Download resources to completion as yt-dlp worker Jobs", long_about = None)]
pub struct Args {
    /// Only watch Downloads in this namespace. Watches all namespaces when unset.
    #[arg(long, env = "DOWNLOAD_NAMESPACE")]
    pub namespace: Option<String>,

    /// Container image of the worker
    #[arg(long, env = "WORKER_IMAGE", default_value = "yt-dlp/yt-dlp:latest")]
    pub worker_image: String,

    /// Seconds between checks of a running worker
    #[arg(long, env = "POLL_INTERVAL_SECS", default_value_t = 15)]
    pub poll_interval_secs: u64,

    /// Pod restarts tolerated before a Download is marked failed
    #[arg(
        long,
        env = "WORKER_BACKOFF_LIMIT",
        default_value_t = 3,
        value_parser = clap::value_parser!(i32).range(0..)
    )]
    pub worker_backoff_limit: i32,
}

impl Args {
    pub fn settings(&self) -> Settings {
        Settings {
            worker: WorkerSettings {
                image: self.worker_image.clone(),
                backoff_limit: self.worker_backoff_limit,
            },
            poll_interval: Duration::from_secs(self.poll_interval_secs.max(1)),
        }
    }
}
