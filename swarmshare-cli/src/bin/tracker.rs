use std::path::Path;

use clap::{Arg, Command};
use tokio_util::sync::CancellationToken;

use swarmshare::{conf::TrackerInfo, tracker, tracker::Tracker};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    // set up cli args
    let matches = Command::new("tracker")
        .about("Metadata tracker for group based peer-to-peer file sharing")
        .arg(
            Arg::new("tracker-info")
                .value_name("TRACKER_INFO")
                .help("Path to the two-line `<ip> <port>` endpoint file")
                .required(true),
        )
        .arg(
            Arg::new("tracker-no")
                .value_name("1|2")
                .help("Which endpoint line to bind")
                .required(true),
        )
        .get_matches();

    let info_path = matches.get_one::<String>("tracker-info").unwrap();
    let tracker_no: usize =
        matches.get_one::<String>("tracker-no").unwrap().parse()?;

    let info = TrackerInfo::load(Path::new(info_path))?;
    let addr = info
        .select(tracker_no)
        .ok_or("tracker number must be 1 or 2")?;

    let shutdown = CancellationToken::new();
    let tracker = Tracker::bind(addr, shutdown.clone()).await?;
    println!(
        "Waiting for incoming connections on {}...",
        tracker.local_addr()
    );

    // the console loop turns a typed `shutdown` into a cancellation
    let console = tokio::spawn(tracker::console_loop(shutdown.clone()));

    // a signal interrupts the accept loop the same way
    let signal_shutdown = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::info!("Interrupt received, shutting down tracker");
            signal_shutdown.cancel();
        }
    });

    tracker.run().await;
    shutdown.cancel();
    let _ = console.await;

    println!("Tracker closed gracefully.");
    Ok(())
}
