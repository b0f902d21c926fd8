// vim: tw=80

use crate::{
    device::ZonedDevice,
    file::MetadataWriter,
    types::*,
};
use std::{
    sync::{Arc, mpsc},
    thread::{self, JoinHandle},
};

struct Request {
    nr_zones: usize,
    done: mpsc::Sender<Result<usize>>,
}

/// Garbage collector.
///
/// Reclaims dirty zones by moving their live extents elsewhere and resetting
/// them.  The work happens on a dedicated thread; passes are serialized.
pub struct Cleaner {
    jh: Option<JoinHandle<()>>,
    tx: Option<mpsc::SyncSender<Request>>,
}

impl Cleaner {
    pub fn new(dev: Arc<ZonedDevice>, journal: Arc<dyn MetadataWriter>)
        -> Self
    {
        let (tx, rx) = mpsc::sync_channel(1);
        let jh = Cleaner::run(dev, journal, rx);
        Cleaner { jh: Some(jh), tx: Some(tx) }
    }

    /// Request a pass over up to `nr_zones` zones.  Does not wait for the
    /// pass to run!
    ///
    /// The returned channel delivers the number of zones reclaimed.  There
    /// is no requirement to read it; the client may drop it and cleaning
    /// will continue in the background.
    pub fn clean(&self, nr_zones: usize) -> mpsc::Receiver<Result<usize>> {
        let (done, rx) = mpsc::channel();
        if let Err(e) = self.tx.as_ref().unwrap()
            .try_send(Request { nr_zones, done })
        {
            match e {
                mpsc::TrySendError::Full(_) => {
                    // No worries; a pass is already queued and cleaning is
                    // idempotent
                },
                mpsc::TrySendError::Disconnected(_) => panic!("{e:?}"),
            }
        }
        rx
    }

    // Start a thread that will clean the device whenever requested.
    fn run(dev: Arc<ZonedDevice>, journal: Arc<dyn MetadataWriter>,
           rx: mpsc::Receiver<Request>) -> JoinHandle<()>
    {
        thread::Builder::new()
            .name("zbdfs-cleaner".to_string())
            .spawn(move || {
                for req in rx {
                    if dev.is_shut_down() {
                        break;
                    }
                    let r = dev.zone_cleaning(req.nr_zones, &*journal);
                    if let Err(e) = &r {
                        tracing::warn!(error = ?e, "cleaning pass failed");
                    }
                    // Ignore errors.  An error here indicates that the
                    // client doesn't want to be notified.
                    let _result = req.done.send(r);
                }
            }).unwrap()
    }

    /// Shut down the background thread, waiting for any pass in flight.
    pub fn shutdown(mut self) {
        drop(self.tx.take());
        if let Some(jh) = self.jh.take() {
            jh.join().unwrap();
        }
    }
}

// LCOV_EXCL_STOP
