// SPDX-License-Identifier: Apache-2.0

//! Actor-backed persistent chain store using [rusqlite] under the hood.
//!
//! Writes go through a single RW connection owned by a blocking task;
//! cursors for chain sync run over their own read-only connections so a
//! slow follower never blocks beacon storage.

use super::Beacon;
use crate::net::utils::Callback;
use crate::protobuf::randchain::BeaconPacket;

use rusqlite::params;
use rusqlite::Connection;
use rusqlite::Error;
use rusqlite::OpenFlags;
use rusqlite::OptionalExtension;
use std::path::{Path, PathBuf};
use tokio::sync::mpsc;
use tokio::task;
use tracing::error;
use tracing::warn;
use tracing::Span;

/// Number of beacons retrieved in a single query from the chain DB.
const BATCH_SIZE: u64 = 300;
/// File is stored under `<base>/db/DB_NAME`.
const DB_NAME: &str = "chain.db";

pub type StoreStreamResponse = Result<BeaconPacket, tonic::Status>;

#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    #[error("internal error")]
    Internal,
    #[error("beacon not found in chain store")]
    NotFound,
    #[error("round {0} already stored with different content")]
    Conflict(u64),
    #[error("genesis mismatch")]
    GenesisMismatch,
    #[error("actor receiver has been closed unexpectedly")]
    ActorClosedRx,
    #[error("cb sender has been closed unexpectedly")]
    CbClosedTx(#[from] tokio::sync::oneshot::error::RecvError),
}

/// Commands for the chain store actor.
enum Cmd {
    Put {
        beacon: Beacon,
        cb: Callback<(), StoreError>,
    },
    Get {
        round: u64,
        cb: Callback<Beacon, StoreError>,
    },
    Last {
        cb: Callback<Beacon, StoreError>,
    },
    Len {
        cb: Callback<u64, StoreError>,
    },
    Cursor {
        from_round: u64,
        cb: Callback<mpsc::Receiver<StoreStreamResponse>, StoreError>,
    },
}

/// Handle for the chain store actor.
#[derive(Clone)]
pub struct ChainStore {
    sender: mpsc::Sender<Cmd>,
}

impl ChainStore {
    /// Starts the chain store actor and returns its handle.
    pub async fn start(path: PathBuf, log: Span) -> Result<Self, StoreError> {
        let (cb_tx, cb_rx) = Callback::new();
        let (cmd_tx, mut cmd_rx) = mpsc::channel::<Cmd>(1);

        task::spawn_blocking(move || {
            // One RW connection reused for all requests except cursors.
            let mut rw_conn = match open(&path) {
                Ok(conn) => {
                    cb_tx.reply(Ok(()));
                    conn
                }
                Err(err) => {
                    error!(parent: &log, "failed to open RW connection: {err}");
                    cb_tx.reply(Err(StoreError::Internal));
                    return;
                }
            };
            while let Some(cmd) = cmd_rx.blocking_recv() {
                match cmd {
                    Cmd::Put { beacon, cb } => match put(&mut rw_conn, &beacon) {
                        Ok(()) => cb.reply(Ok(())),
                        Err(err @ StoreError::Conflict(_)) => cb.reply(Err(err)),
                        Err(err) => {
                            error!(parent: &log, "failed to put beacon: {err}");
                            cb.reply(Err(StoreError::Internal));
                            return;
                        }
                    },
                    Cmd::Get { round, cb } => match get(&rw_conn, round) {
                        Ok(Some(beacon)) => cb.reply(Ok(beacon)),
                        Ok(None) => cb.reply(Err(StoreError::NotFound)),
                        Err(err) => {
                            error!(parent: &log, "failed to get beacon of round {round}: {err}");
                            cb.reply(Err(StoreError::Internal));
                            return;
                        }
                    },
                    Cmd::Last { cb } => match last(&rw_conn) {
                        Ok(Some(beacon)) => cb.reply(Ok(beacon)),
                        Ok(None) => cb.reply(Err(StoreError::NotFound)),
                        Err(err) => {
                            error!(parent: &log, "failed to get last beacon: {err}");
                            cb.reply(Err(StoreError::Internal));
                            return;
                        }
                    },
                    Cmd::Len { cb } => {
                        match rw_conn.query_row("SELECT COUNT(*) FROM beacons", [], |row| {
                            row.get::<_, u64>(0)
                        }) {
                            Ok(len) => cb.reply(Ok(len)),
                            Err(err) => {
                                error!(parent: &log, "failed to count beacons: {err}");
                                cb.reply(Err(StoreError::Internal));
                                return;
                            }
                        }
                    }
                    Cmd::Cursor { from_round, cb } => {
                        match cursor(&path, from_round, log.clone()) {
                            Ok(client_rx) => cb.reply(Ok(client_rx)),
                            Err(err) => {
                                error!(parent: &log, "cursor: failed to open RO connection: {err}");
                                cb.reply(Err(StoreError::Internal));
                                return;
                            }
                        }
                    }
                }
            }
        });

        cb_rx.await??;

        Ok(Self { sender: cmd_tx })
    }

    pub async fn put(&self, beacon: Beacon) -> Result<(), StoreError> {
        let (cb_tx, cb_rx) = Callback::new();
        self.sender
            .send(Cmd::Put { beacon, cb: cb_tx })
            .await
            .map_err(|_| StoreError::ActorClosedRx)?;

        cb_rx.await?
    }

    pub async fn get(&self, round: u64) -> Result<Beacon, StoreError> {
        let (cb_tx, cb_rx) = Callback::new();
        self.sender
            .send(Cmd::Get { round, cb: cb_tx })
            .await
            .map_err(|_| StoreError::ActorClosedRx)?;

        cb_rx.await?
    }

    pub async fn last(&self) -> Result<Beacon, StoreError> {
        let (cb_tx, cb_rx) = Callback::new();
        self.sender
            .send(Cmd::Last { cb: cb_tx })
            .await
            .map_err(|_| StoreError::ActorClosedRx)?;

        cb_rx.await?
    }

    pub async fn len(&self) -> Result<u64, StoreError> {
        let (cb_tx, cb_rx) = Callback::new();
        self.sender
            .send(Cmd::Len { cb: cb_tx })
            .await
            .map_err(|_| StoreError::ActorClosedRx)?;

        cb_rx.await?
    }

    /// Ordered replay of stored beacons starting at `from_round`.
    pub async fn cursor(
        &self,
        from_round: u64,
        cb: Callback<mpsc::Receiver<StoreStreamResponse>, StoreError>,
    ) {
        // Catch callback if actor is in failed state.
        if let Err(mpsc::error::SendError(Cmd::Cursor { from_round: _, cb })) =
            self.sender.send(Cmd::Cursor { from_round, cb }).await
        {
            cb.reply(Err(StoreError::Internal));
        }
    }

    /// Inserts the genesis beacon if the store is empty, or asserts that
    /// `genesis_seed` equals the one already stored.
    pub async fn check_genesis(&self, genesis_seed: &[u8], log: &Span) -> Result<(), StoreError> {
        match self.get(0).await {
            Ok(beacon) => {
                if beacon.signature == genesis_seed {
                    Ok(())
                } else {
                    error!(
                        parent: log,
                        "genesis mismatch: already stored {} != {}",
                        hex::encode(&beacon.signature),
                        hex::encode(genesis_seed)
                    );

                    Err(StoreError::GenesisMismatch)
                }
            }
            Err(StoreError::NotFound) => {
                warn!(
                    parent: log,
                    "chain store is empty, adding genesis {}",
                    hex::encode(genesis_seed)
                );
                self.put(Beacon::genesis(genesis_seed.to_vec())).await?;
                Ok(())
            }
            Err(err) => Err(err),
        }
    }
}

fn open(path: &Path) -> Result<Connection, Error> {
    let conn = Connection::open(path.join(DB_NAME))?;
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS beacons (
            round INTEGER PRIMARY KEY,
            previous_round INTEGER NOT NULL,
            previous_sig BLOB NOT NULL,
            signature BLOB NOT NULL
        ) WITHOUT ROWID",
        [],
    )?;

    Ok(conn)
}

/// Insert is transactional: either the full row lands or nothing does.
/// A second put of an identical beacon is a no-op; a differing one for a
/// stored round reports [`StoreError::Conflict`].
fn put(conn: &mut Connection, beacon: &Beacon) -> Result<(), StoreError> {
    let tr = conn.transaction().map_err(|_| StoreError::Internal)?;
    {
        let existing = tr
            .prepare_cached(
                "SELECT previous_round, previous_sig, signature FROM beacons WHERE round = ?1",
            )
            .and_then(|mut stmt| {
                stmt.query_row([beacon.round], |row| {
                    Ok(Beacon {
                        round: beacon.round,
                        previous_round: row.get(0)?,
                        previous_sig: row.get(1)?,
                        signature: row.get(2)?,
                    })
                })
                .optional()
            })
            .map_err(|_| StoreError::Internal)?;

        match existing {
            Some(stored) if stored == *beacon => return Ok(()),
            Some(_) => return Err(StoreError::Conflict(beacon.round)),
            None => {}
        }

        tr.prepare_cached(
            "INSERT INTO beacons (round, previous_round, previous_sig, signature)
             VALUES (?1, ?2, ?3, ?4)",
        )
        .and_then(|mut stmt| {
            stmt.execute(params![
                beacon.round,
                beacon.previous_round,
                &beacon.previous_sig,
                &beacon.signature,
            ])
        })
        .map_err(|_| StoreError::Internal)?;
    }
    tr.commit().map_err(|_| StoreError::Internal)
}

fn get(conn: &Connection, round: u64) -> Result<Option<Beacon>, Error> {
    conn.prepare_cached(
        "SELECT previous_round, previous_sig, signature FROM beacons WHERE round = ?1",
    )?
    .query_row([round], |row| {
        Ok(Beacon {
            round,
            previous_round: row.get(0)?,
            previous_sig: row.get(1)?,
            signature: row.get(2)?,
        })
    })
    .optional()
}

fn last(conn: &Connection) -> Result<Option<Beacon>, Error> {
    conn.prepare_cached(
        "SELECT round, previous_round, previous_sig, signature
         FROM beacons
         WHERE round = (SELECT MAX(round) FROM beacons)",
    )?
    .query_row([], |row| {
        Ok(Beacon {
            round: row.get(0)?,
            previous_round: row.get(1)?,
            previous_sig: row.get(2)?,
            signature: row.get(3)?,
        })
    })
    .optional()
}

fn get_batch(conn: &Connection, from_round: u64) -> Result<Vec<BeaconPacket>, Error> {
    conn.prepare_cached(
        "SELECT round, previous_round, previous_sig, signature
         FROM beacons
         WHERE round >= ?1
         ORDER BY round ASC
         LIMIT ?2",
    )?
    .query_map([from_round, BATCH_SIZE], |row| {
        Ok(BeaconPacket {
            round: row.get(0)?,
            previous_round: row.get(1)?,
            previous_sig: row.get(2)?,
            signature: row.get(3)?,
        })
    })?
    .collect()
}

/// Lazy finite replay over a dedicated read-only connection. The stream
/// ends with a `not_found` status once the tail is reached.
fn cursor(
    path: &Path,
    start_from: u64,
    log: Span,
) -> Result<mpsc::Receiver<StoreStreamResponse>, Error> {
    let ro_conn =
        Connection::open_with_flags(path.join(DB_NAME), OpenFlags::SQLITE_OPEN_READ_ONLY)?;
    let batch_size = usize::try_from(BATCH_SIZE).expect("fits usize");
    let (tx, rx) = mpsc::channel::<StoreStreamResponse>(batch_size);

    let mut from = start_from;
    tokio::task::spawn_blocking(move || loop {
        match get_batch(&ro_conn, from) {
            Ok(beacons) => {
                let received_len = beacons.len();
                let mut highest = from;

                for b in beacons {
                    highest = b.round;
                    if tx.blocking_send(Ok(b)).is_err() {
                        return;
                    }
                }
                if received_len < batch_size {
                    let _ = tx.blocking_send(Err(tonic::Status::not_found(format!(
                        "no beacons stored above round {highest}"
                    ))));
                    return;
                }
                from = highest + 1;
            }
            Err(err) => {
                error!(parent: &log, "cursor: failed to read batch: {err}");
                return;
            }
        };
    });

    Ok(rx)
}

#[cfg(test)]
mod test {
    use super::*;
    use tracing::info_span;

    /// Beacons 0..=rounds with deterministic chained payloads.
    fn generate(rounds: u64) -> Vec<Beacon> {
        let mut beacons = vec![Beacon::genesis(vec![0; 8])];
        for r in 1..=rounds {
            let prev = beacons.last().unwrap().clone();
            beacons.push(Beacon::next(&prev, r, r.to_be_bytes().into()));
        }
        beacons
    }

    async fn new_store(dir: &tempfile::TempDir) -> ChainStore {
        ChainStore::start(dir.path().to_path_buf(), info_span!("store_test"))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn put_get_last_len() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = new_store(&dir).await;

        let total = 555;
        let beacons = generate(total);
        for b in &beacons {
            store.put(b.clone()).await.unwrap();
        }

        let last = store.last().await.unwrap();
        assert_eq!(&last, beacons.last().unwrap());
        assert_eq!(store.len().await.unwrap(), total + 1);

        for b in &beacons {
            assert_eq!(&store.get(b.round).await.unwrap(), b);
        }
        assert!(matches!(
            store.get(total + 1).await,
            Err(StoreError::NotFound)
        ));
    }

    #[tokio::test]
    async fn put_is_idempotent_and_detects_conflicts() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = new_store(&dir).await;

        let beacons = generate(2);
        for b in &beacons {
            store.put(b.clone()).await.unwrap();
        }

        // Same beacon again: fine.
        store.put(beacons[2].clone()).await.unwrap();
        assert_eq!(store.len().await.unwrap(), 3);

        // Same round, different signature: conflict, nothing overwritten.
        let mut forged = beacons[2].clone();
        forged.signature = vec![0xde, 0xad];
        assert!(matches!(
            store.put(forged).await,
            Err(StoreError::Conflict(2))
        ));
        assert_eq!(&store.get(2).await.unwrap(), &beacons[2]);
    }

    #[tokio::test]
    async fn skipped_round_linkage_is_preserved() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = new_store(&dir).await;

        let genesis = Beacon::genesis(vec![9; 8]);
        let b1 = Beacon::next(&genesis, 1, vec![1]);
        // Round 2 skipped: round 3 links back to round 1.
        let b3 = Beacon::next(&b1, 3, vec![3]);

        store.put(genesis).await.unwrap();
        store.put(b1.clone()).await.unwrap();
        store.put(b3.clone()).await.unwrap();

        let got = store.get(3).await.unwrap();
        assert_eq!(got.previous_round, 1);
        assert_eq!(got.previous_sig, b1.signature);
        assert_eq!(store.last().await.unwrap().round, 3);
    }

    #[tokio::test]
    async fn cursor_replays_in_order() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = new_store(&dir).await;

        let total = 400;
        let beacons = generate(total);
        for b in &beacons {
            store.put(b.clone()).await.unwrap();
        }

        let (cb_tx, cb_rx) = Callback::new();
        store.cursor(1, cb_tx).await;
        let mut rx = cb_rx.await.unwrap().unwrap();

        for expected in &beacons[1..] {
            let packet = rx.recv().await.unwrap().unwrap();
            assert_eq!(&Beacon::from(packet), expected);
        }

        // Tail reached: final status closes the stream.
        let status = rx.recv().await.unwrap().unwrap_err();
        assert_eq!(status.code(), tonic::Code::NotFound);
    }
}
