use std::collections::HashMap;
use std::hash::Hash;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Mutex, MutexGuard};

use crate::error::SyncError;

struct InFlight<K, T> {
    result_senders: Vec<Sender<(K, T)>>,
}

pub struct CoalescingQueue<K, T> {
    in_flight: Mutex<HashMap<K, InFlight<K, T>>>,
    work_sender: Mutex<Option<Sender<K>>>,
    work_receiver: Mutex<Receiver<K>>,
}

impl<K, T> CoalescingQueue<K, T>
where
    K: Eq + Hash + Clone + Send,
    T: Clone + Send,
{
    pub fn new() -> Self {
        let (work_sender, work_receiver) = mpsc::channel();
        Self {
            in_flight: Mutex::new(HashMap::new()),
            work_sender: Mutex::new(Some(work_sender)),
            work_receiver: Mutex::new(work_receiver),
        }
    }

    pub fn submit(&self, key: K, reply: Sender<(K, T)>) -> Result<bool, SyncError> {
        {
            let mut map = lock(&self.in_flight)?;
            if let Some(flight) = map.get_mut(&key) {
                flight.result_senders.push(reply);
                return Ok(false);
            }
            map.insert(
                key.clone(),
                InFlight {
                    result_senders: vec![reply],
                },
            );
        }

        let sender = lock(&self.work_sender)?;
        match sender.as_ref() {
            Some(sender) if sender.send(key.clone()).is_ok() => Ok(true),
            _ => {
                lock(&self.in_flight)?.remove(&key);
                Err(SyncError::Resource("worker queue is closed".to_string()))
            }
        }
    }

    pub fn close(&self) {
        if let Ok(mut sender) = self.work_sender.lock() {
            sender.take();
        }
    }

    pub fn work(&self, handler: impl Fn(&K) -> T) {
        loop {
            let key = {
                let Ok(receiver) = self.work_receiver.lock() else {
                    break;
                };
                match receiver.recv() {
                    Ok(key) => key,
                    Err(_) => break,
                }
            };

            let result = handler(&key);

            let waiters = match self.in_flight.lock() {
                Ok(mut map) => map.remove(&key),
                Err(_) => None,
            };
            if let Some(flight) = waiters {
                for sender in flight.result_senders {
                    let _ = sender.send((key.clone(), result.clone()));
                }
            }
        }
    }
}

impl<K, T> Default for CoalescingQueue<K, T>
where
    K: Eq + Hash + Clone + Send,
    T: Clone + Send,
{
    fn default() -> Self {
        Self::new()
    }
}

fn lock<V>(mutex: &Mutex<V>) -> Result<MutexGuard<'_, V>, SyncError> {
    mutex
        .lock()
        .map_err(|_| SyncError::Resource("worker queue mutex poisoned".to_string()))
}
