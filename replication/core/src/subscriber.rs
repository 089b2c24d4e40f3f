// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Per-subscriber delivery state.
//!
//! While a subscriber catches up from the archive, live frames are buffered.
//! `set_caught_up` drains the buffer and flips the subscriber to direct
//! forwarding. Delivery is filtered at transaction granularity by commit
//! watermark, so the transition from catch-up to live produces neither a gap
//! nor a duplicate: a transaction already delivered (by catch-up or by an
//! earlier live send) is dropped wholesale when it shows up again.

use std::collections::VecDeque;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::debug;

use crate::{
    change::Watermark,
    error::{ReplicationError, ReplicationResult},
    protocol::{Downstream, ErrorBody, SubscriberMode, SubscriptionRequest},
};

struct DeliveryState {
    caught_up: bool,
    backlog: VecDeque<Downstream>,
    /// Highest commit watermark fully delivered to this subscriber.
    delivered: Watermark,
    /// Set while frames of an already-delivered transaction are dropped.
    skipping: bool,
    closed: bool,
}

pub struct Subscriber {
    id: String,
    mode: SubscriberMode,
    replica_version: Watermark,
    watermark: Watermark,
    initial: bool,
    sender: Mutex<Option<mpsc::Sender<Downstream>>>,
    state: Mutex<DeliveryState>,
}

impl Subscriber {
    /// Create a subscriber from its request. `capacity` bounds the frames in
    /// flight to the transport; catch-up readers block on it, which is what
    /// caps their memory use at roughly twice the fetch batch.
    pub fn new(
        request: SubscriptionRequest,
        capacity: usize,
    ) -> (std::sync::Arc<Self>, mpsc::Receiver<Downstream>) {
        let (sender, receiver) = mpsc::channel(capacity.max(2));
        let subscriber = std::sync::Arc::new(Self {
            id: request.id,
            mode: request.mode,
            replica_version: request.replica_version,
            watermark: request.watermark.clone(),
            initial: request.initial,
            sender: Mutex::new(Some(sender)),
            state: Mutex::new(DeliveryState {
                caught_up: false,
                backlog: VecDeque::new(),
                delivered: request.watermark,
                skipping: false,
                closed: false,
            }),
        });
        (subscriber, receiver)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn mode(&self) -> SubscriberMode {
        self.mode
    }

    pub fn replica_version(&self) -> &Watermark {
        &self.replica_version
    }

    /// The watermark the subscriber asked to resume from.
    pub fn watermark(&self) -> &Watermark {
        &self.watermark
    }

    pub fn initial(&self) -> bool {
        self.initial
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    fn sender(&self) -> ReplicationResult<mpsc::Sender<Downstream>> {
        self.sender
            .lock()
            .clone()
            .ok_or(ReplicationError::Shutdown)
    }

    /// Decide whether `frame` should reach the subscriber, updating the
    /// transaction filter. Frames of a transaction whose commit watermark is
    /// not beyond `delivered` are dropped as a unit.
    fn admit(&self, frame: &Downstream) -> bool {
        let mut state = self.state.lock();
        if state.closed {
            return false;
        }
        match frame {
            Downstream::Begin { commit_watermark } => {
                state.skipping = *commit_watermark <= state.delivered;
                !state.skipping
            }
            Downstream::Commit { watermark } => {
                if state.skipping {
                    state.skipping = false;
                    return false;
                }
                state.delivered = watermark.clone();
                true
            }
            Downstream::Data(_) | Downstream::Rollback => !state.skipping,
            Downstream::Status { .. } | Downstream::Control(_) | Downstream::Error(_) => true,
        }
    }

    /// Deliver a frame from a catch-up reader. Runs on a pool worker thread;
    /// blocks when the transport is saturated.
    pub(crate) fn send_catchup(&self, frame: Downstream) -> ReplicationResult<()> {
        if !self.admit(&frame) {
            return Ok(());
        }
        self.blocking_deliver(frame)
    }

    /// Deliver a live frame. Before `set_caught_up` the frame is buffered;
    /// afterwards it is filtered and forwarded directly.
    pub(crate) async fn send_live(&self, frame: Downstream) -> ReplicationResult<()> {
        {
            let mut state = self.state.lock();
            if state.closed {
                return Err(ReplicationError::Shutdown);
            }
            if !state.caught_up {
                state.backlog.push_back(frame);
                return Ok(());
            }
        }
        if !self.admit(&frame) {
            return Ok(());
        }
        let sender = self.sender()?;
        sender.send(frame).await.map_err(|_| {
            self.mark_closed();
            ReplicationError::Transport("subscriber disconnected".to_string())
        })
    }

    /// Flush live frames buffered during catch-up, then switch to direct
    /// forwarding. Called by the catch-up reader once the archive iteration
    /// drains, so delivery stays single-threaded across the transition.
    pub(crate) fn set_caught_up(&self) -> ReplicationResult<()> {
        loop {
            let batch = {
                let mut state = self.state.lock();
                if state.backlog.is_empty() {
                    state.caught_up = true;
                    debug!("subscriber {} caught up", self.id);
                    return Ok(());
                }
                std::mem::take(&mut state.backlog)
            };
            for frame in batch {
                if self.admit(&frame) {
                    self.blocking_deliver(frame)?;
                }
            }
        }
    }

    /// Initial frame confirming the subscription, sent before catch-up.
    pub(crate) fn send_handshake(&self) -> ReplicationResult<()> {
        let frame = Downstream::Status {
            ack: None,
            watermark: self.watermark.clone(),
        };
        self.blocking_deliver(frame)
    }

    /// Send a terminal error frame and close the stream.
    pub(crate) fn close_with_error(&self, err: &ReplicationError) {
        let frame = Downstream::Error(ErrorBody::from(err));
        let _ = self.blocking_deliver(frame);
        self.mark_closed();
    }

    pub(crate) fn close(&self) {
        self.mark_closed();
    }

    fn mark_closed(&self) {
        self.state.lock().closed = true;
        // Dropping the sender ends the subscriber's stream.
        self.sender.lock().take();
    }

    fn blocking_deliver(&self, frame: Downstream) -> ReplicationResult<()> {
        let sender = self.sender()?;
        sender.blocking_send(frame).map_err(|_| {
            self.mark_closed();
            ReplicationError::Transport("subscriber disconnected".to_string())
        })
    }
}
