//! Message passing between decomposition ranks
//!
//! All inter-rank traffic in the engine goes through three primitive
//! patterns, mirrored here as methods on [`DdComm`]:
//!
//! 1. **Paired exchange** along a decomposition dimension, forward or
//!    backward ([`DdComm::sendrecv_ints`], [`DdComm::sendrecv_vecs`]).
//! 2. **Two-way simultaneous exchange** ([`DdComm::sendrecv2_vecs`]): both
//!    directions posted at once. An environment switch degrades this to two
//!    ordered exchanges for interconnects that prefer paired calls.
//! 3. **Collectives** rooted at the decomposition master (broadcast,
//!    gather(v), scatter(v)) and gathers/broadcasts on per-dimension *row*
//!    communicators used by load balancing.
//!
//! The transport is an in-process [`Network`]: every rank owns one mailbox
//! and a sender handle to every other mailbox. Matching is by (source, tag)
//! with per-pair FIFO order, so the call sequences used by the engine are
//! deadlock-free without any buffering limits. A payload type mismatch means
//! the two sides disagree about the protocol; that is an internal
//! inconsistency and fails hard.

use std::collections::VecDeque;

use crossbeam_channel::{unbounded, Receiver, Sender};

use crate::Rvec;

/// Direction of a paired exchange along a decomposition dimension.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Direction {
    /// Send towards the neighbor with the next higher cell coordinate.
    Forward,
    /// Send towards the neighbor with the next lower cell coordinate.
    Backward,
}

/// Typed message body. No serialization happens on the hot path.
#[derive(Clone, Debug)]
pub enum Payload {
    /// Integer data: indices, counts and flag words.
    Ints(Vec<i64>),
    /// Scalar data: fractions and load figures.
    Reals(Vec<f64>),
    /// Coordinate data.
    Vecs(Vec<Rvec>),
}

impl Payload {
    fn into_ints(self) -> Vec<i64> {
        match self {
            Payload::Ints(v) => v,
            other => panic!("internal inconsistency: expected int payload, got {other:?}"),
        }
    }
    fn into_reals(self) -> Vec<f64> {
        match self {
            Payload::Reals(v) => v,
            other => panic!("internal inconsistency: expected real payload, got {other:?}"),
        }
    }
    fn into_vecs(self) -> Vec<Rvec> {
        match self {
            Payload::Vecs(v) => v,
            other => panic!("internal inconsistency: expected vector payload, got {other:?}"),
        }
    }
}

#[derive(Debug)]
struct Envelope {
    src: usize,
    tag: u32,
    payload: Payload,
}

// Fixed tag lanes. Program order per rank pair is preserved by the
// transport, so one lane per traffic class is enough to keep the engine's
// call sequences matched.
const TAG_P2P: u32 = 0;
const TAG_P2P_BW: u32 = 1;
const TAG_COLL: u32 = 2;
const TAG_ROW: u32 = 3;
/// Base for point-to-point state gathers tagged with the sending rank.
pub const TAG_STATE_BASE: u32 = 16;

// ============================================================================
// Mailboxes and the in-process network
// ============================================================================

/// One rank's endpoint: a receiver plus sender handles to every rank.
#[derive(Debug)]
pub struct Mailbox {
    rank: usize,
    senders: Vec<Sender<Envelope>>,
    rx: Receiver<Envelope>,
    pending: VecDeque<Envelope>,
}

impl Mailbox {
    fn send(&self, dest: usize, tag: u32, payload: Payload) {
        self.senders[dest]
            .send(Envelope { src: self.rank, tag, payload })
            .expect("internal inconsistency: peer mailbox dropped mid-run");
    }

    /// Blocking receive matching (source, tag); out-of-order arrivals are
    /// parked until their own matching call.
    fn recv(&mut self, src: usize, tag: u32) -> Payload {
        if let Some(pos) = self.pending.iter().position(|e| e.src == src && e.tag == tag) {
            return self.pending.remove(pos).expect("position just found").payload;
        }
        loop {
            let env = self
                .rx
                .recv()
                .expect("internal inconsistency: network disconnected mid-run");
            if env.src == src && env.tag == tag {
                return env.payload;
            }
            self.pending.push_back(env);
        }
    }
}

/// Builder for a fully connected set of mailboxes.
pub struct Network;

impl Network {
    /// Create `n` endpoints. Endpoint `i` is for rank `i`.
    pub fn new(n: usize) -> Vec<Mailbox> {
        let mut txs = Vec::with_capacity(n);
        let mut rxs = Vec::with_capacity(n);
        for _ in 0..n {
            let (tx, rx) = unbounded();
            txs.push(tx);
            rxs.push(rx);
        }
        rxs.into_iter()
            .enumerate()
            .map(|(rank, rx)| Mailbox {
                rank,
                senders: txs.clone(),
                rx,
                pending: VecDeque::new(),
            })
            .collect()
    }
}

// ============================================================================
// Row communicators
// ============================================================================

/// A row of cells along one decomposition dimension. `members[k]` is the
/// group rank of the cell with coordinate `k` along that dimension; the row
/// root is `members[0]`.
#[derive(Clone, Debug)]
pub struct RowComm {
    /// Group ranks of the row members, ordered by cell coordinate.
    pub members: Vec<usize>,
    /// This rank's position in `members`.
    pub my_pos: usize,
}

impl RowComm {
    /// Whether this rank is the row root.
    #[inline]
    pub fn is_root(&self) -> bool {
        self.my_pos == 0
    }
}

// ============================================================================
// The rank communicator
// ============================================================================

/// Communicator of one particle-particle rank.
///
/// `group[r]` maps a group rank to the underlying network rank, so the same
/// mailbox can serve both the whole simulation and a split subgroup.
#[derive(Debug)]
pub struct DdComm {
    mbox: Mailbox,
    /// Network ranks of this communicator's members, by group rank.
    pub group: Vec<usize>,
    /// This rank within the group.
    pub rank: usize,
    /// Group rank of the decomposition master.
    pub masterrank: usize,
    /// Use two ordered paired exchanges instead of the simultaneous form.
    pub ordered_two_phase: bool,
}

impl DdComm {
    /// Wrap a mailbox as a member of `group` (network ranks, group order).
    pub fn new(mbox: Mailbox, group: Vec<usize>) -> Self {
        let rank = group
            .iter()
            .position(|&g| g == mbox.rank)
            .expect("internal inconsistency: rank not a member of its own group");
        Self { mbox, group, rank, masterrank: 0, ordered_two_phase: false }
    }

    /// A communicator over all `n` ranks of a fresh network endpoint.
    pub fn all(mbox: Mailbox, n: usize) -> Self {
        Self::new(mbox, (0..n).collect())
    }

    /// Number of ranks in this communicator.
    #[inline]
    pub fn nranks(&self) -> usize {
        self.group.len()
    }

    /// Whether this rank is the decomposition master.
    #[inline]
    pub fn is_master(&self) -> bool {
        self.rank == self.masterrank
    }

    #[inline]
    fn net(&self, group_rank: usize) -> usize {
        self.group[group_rank]
    }

    // -------------------------------------------------------------- p2p ---

    /// Post an integer message to group rank `to`.
    pub fn send_ints(&self, to: usize, tag: u32, data: &[i64]) {
        self.mbox.send(self.net(to), tag, Payload::Ints(data.to_vec()));
    }

    /// Post a coordinate message to group rank `to`.
    pub fn send_vecs(&self, to: usize, tag: u32, data: &[Rvec]) {
        self.mbox.send(self.net(to), tag, Payload::Vecs(data.to_vec()));
    }

    /// Post a real-valued message to group rank `to`.
    pub fn send_reals(&self, to: usize, tag: u32, data: &[f64]) {
        self.mbox.send(self.net(to), tag, Payload::Reals(data.to_vec()));
    }

    /// Blocking receive of an integer message from group rank `from`.
    pub fn recv_ints(&mut self, from: usize, tag: u32) -> Vec<i64> {
        let src = self.net(from);
        self.mbox.recv(src, tag).into_ints()
    }

    /// Blocking receive of a real-valued message from group rank `from`.
    pub fn recv_reals(&mut self, from: usize, tag: u32) -> Vec<f64> {
        let src = self.net(from);
        self.mbox.recv(src, tag).into_reals()
    }

    /// Blocking receive of a coordinate message from group rank `from`.
    pub fn recv_vecs(&mut self, from: usize, tag: u32) -> Vec<Rvec> {
        let src = self.net(from);
        self.mbox.recv(src, tag).into_vecs()
    }

    /// Paired integer exchange: send to `rank_s`, receive from `rank_r`.
    /// Zero-length sides are elided, matching the callers that pre-exchange
    /// counts.
    pub fn sendrecv_ints(&mut self, rank_s: usize, n_s: &[i64], rank_r: usize, n_r: usize) -> Vec<i64> {
        if !n_s.is_empty() {
            self.send_ints(rank_s, TAG_P2P, n_s);
        }
        if n_r > 0 {
            self.recv_ints(rank_r, TAG_P2P)
        } else {
            Vec::new()
        }
    }

    /// Paired real exchange: send to `rank_s`, receive from `rank_r`.
    pub fn sendrecv_reals(&mut self, rank_s: usize, buf_s: &[f64], rank_r: usize, n_r: usize) -> Vec<f64> {
        if !buf_s.is_empty() {
            self.send_reals(rank_s, TAG_P2P, buf_s);
        }
        if n_r > 0 {
            self.recv_reals(rank_r, TAG_P2P)
        } else {
            Vec::new()
        }
    }

    /// Paired coordinate exchange: send to `rank_s`, receive from `rank_r`.
    pub fn sendrecv_vecs(&mut self, rank_s: usize, buf_s: &[Rvec], rank_r: usize, n_r: usize) -> Vec<Rvec> {
        if !buf_s.is_empty() {
            self.send_vecs(rank_s, TAG_P2P, buf_s);
        }
        if n_r > 0 {
            self.recv_vecs(rank_r, TAG_P2P)
        } else {
            Vec::new()
        }
    }

    /// Two-way simultaneous coordinate exchange with the forward and
    /// backward neighbor. Returns `(recv_fw, recv_bw)` where `recv_fw`
    /// arrives from the backward neighbor (it travels forward).
    ///
    /// With `ordered_two_phase` the exchange degrades to two paired calls;
    /// the transport buffers sends, so both forms complete without overlap.
    pub fn sendrecv2_vecs(
        &mut self,
        rank_fw: usize,
        rank_bw: usize,
        s_fw: &[Rvec],
        s_bw: &[Rvec],
        n_r_fw: usize,
        n_r_bw: usize,
    ) -> (Vec<Rvec>, Vec<Rvec>) {
        if self.ordered_two_phase {
            let r_fw = self.sendrecv_vecs_tag(rank_fw, s_fw, rank_bw, n_r_fw, TAG_P2P);
            let r_bw = self.sendrecv_vecs_tag(rank_bw, s_bw, rank_fw, n_r_bw, TAG_P2P_BW);
            (r_fw, r_bw)
        } else {
            if !s_fw.is_empty() {
                self.send_vecs(rank_fw, TAG_P2P, s_fw);
            }
            if !s_bw.is_empty() {
                self.send_vecs(rank_bw, TAG_P2P_BW, s_bw);
            }
            let r_fw = if n_r_fw > 0 { self.recv_vecs(rank_bw, TAG_P2P) } else { Vec::new() };
            let r_bw = if n_r_bw > 0 { self.recv_vecs(rank_fw, TAG_P2P_BW) } else { Vec::new() };
            (r_fw, r_bw)
        }
    }

    fn sendrecv_vecs_tag(
        &mut self,
        rank_s: usize,
        buf_s: &[Rvec],
        rank_r: usize,
        n_r: usize,
        tag: u32,
    ) -> Vec<Rvec> {
        if !buf_s.is_empty() {
            self.send_vecs(rank_s, tag, buf_s);
        }
        if n_r > 0 {
            self.recv_vecs(rank_r, tag)
        } else {
            Vec::new()
        }
    }

    // ------------------------------------------------------- collectives ---

    /// Broadcast a real buffer from the decomposition master.
    pub fn bcast_reals(&mut self, data: &mut Vec<f64>) {
        if self.is_master() {
            for r in 0..self.nranks() {
                if r != self.rank {
                    self.mbox.send(self.net(r), TAG_COLL, Payload::Reals(data.clone()));
                }
            }
        } else {
            let src = self.net(self.masterrank);
            *data = self.mbox.recv(src, TAG_COLL).into_reals();
        }
    }

    /// Fixed-size gather to the master: returns the concatenation in rank
    /// order on the master, `None` elsewhere.
    pub fn gather_ints(&mut self, sbuf: &[i64]) -> Option<Vec<i64>> {
        if self.is_master() {
            let mut out = Vec::with_capacity(sbuf.len() * self.nranks());
            for r in 0..self.nranks() {
                if r == self.rank {
                    out.extend_from_slice(sbuf);
                } else {
                    out.extend(self.recv_ints(r, TAG_COLL));
                }
            }
            Some(out)
        } else {
            self.send_ints(self.masterrank, TAG_COLL, sbuf);
            None
        }
    }

    /// Variable-size gather to the master. The master supplies the expected
    /// per-rank counts; every rank sends its own block.
    pub fn gatherv_ints(&mut self, sbuf: &[i64], rcounts: Option<&[usize]>) -> Option<Vec<i64>> {
        if self.is_master() {
            let rcounts = rcounts.expect("master must supply receive counts");
            let mut out = Vec::with_capacity(rcounts.iter().sum());
            for r in 0..self.nranks() {
                if r == self.rank {
                    out.extend_from_slice(sbuf);
                } else if rcounts[r] > 0 {
                    out.extend(self.recv_ints(r, TAG_COLL));
                } else {
                    // Zero-length blocks are elided on the sending side.
                }
            }
            Some(out)
        } else {
            if !sbuf.is_empty() {
                self.send_ints(self.masterrank, TAG_COLL, sbuf);
            }
            None
        }
    }

    /// Fixed-size scatter from the master: every rank gets `count` entries.
    pub fn scatter_ints(&mut self, sbuf: Option<&[i64]>, count: usize) -> Vec<i64> {
        if self.is_master() {
            let sbuf = sbuf.expect("master must supply the scatter source");
            for r in 0..self.nranks() {
                if r != self.rank {
                    self.send_ints(r, TAG_COLL, &sbuf[r * count..(r + 1) * count]);
                }
            }
            sbuf[self.rank * count..(self.rank + 1) * count].to_vec()
        } else {
            self.recv_ints(self.masterrank, TAG_COLL)
        }
    }

    /// Variable-size scatter from the master, block `r` sized `scounts[r]`.
    pub fn scatterv_ints(&mut self, src: Option<(&[i64], &[usize])>, n_r: usize) -> Vec<i64> {
        if self.is_master() {
            let (sbuf, scounts) = src.expect("master must supply the scatter source");
            let mut off = 0;
            let mut own = Vec::new();
            for r in 0..self.nranks() {
                let block = &sbuf[off..off + scounts[r]];
                if r == self.rank {
                    own = block.to_vec();
                } else if !block.is_empty() {
                    self.send_ints(r, TAG_COLL, block);
                }
                off += scounts[r];
            }
            own
        } else if n_r > 0 {
            self.recv_ints(self.masterrank, TAG_COLL)
        } else {
            Vec::new()
        }
    }

    // -------------------------------------------------------------- rows ---

    /// Gather a fixed-size real block from every row member to the row root.
    pub fn row_gather_reals(&mut self, row: &RowComm, sbuf: &[f64]) -> Option<Vec<f64>> {
        if row.is_root() {
            let mut out = Vec::with_capacity(sbuf.len() * row.members.len());
            for (pos, &m) in row.members.iter().enumerate() {
                if pos == row.my_pos {
                    out.extend_from_slice(sbuf);
                } else {
                    let src = self.net(m);
                    out.extend(self.mbox.recv(src, TAG_ROW).into_reals());
                }
            }
            Some(out)
        } else {
            let root = self.net(row.members[0]);
            self.mbox.send(root, TAG_ROW, Payload::Reals(sbuf.to_vec()));
            None
        }
    }

    /// Broadcast a real buffer from the row root to every row member.
    pub fn row_bcast_reals(&mut self, row: &RowComm, data: &mut Vec<f64>) {
        if row.is_root() {
            for (pos, &m) in row.members.iter().enumerate() {
                if pos != row.my_pos {
                    self.mbox.send(self.net(m), TAG_ROW, Payload::Reals(data.clone()));
                }
            }
        } else {
            let root = self.net(row.members[0]);
            *data = self.mbox.recv(root, TAG_ROW).into_reals();
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn spawn_ranks<F, T>(n: usize, f: F) -> Vec<T>
    where
        F: Fn(DdComm) -> T + Send + Sync + 'static,
        T: Send + 'static,
    {
        let boxes = Network::new(n);
        let f = std::sync::Arc::new(f);
        let handles: Vec<_> = boxes
            .into_iter()
            .map(|mb| {
                let f = f.clone();
                thread::spawn(move || f(DdComm::all(mb, n)))
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    }

    #[test]
    fn ring_sendrecv_ints() {
        let out = spawn_ranks(3, |mut comm| {
            let me = comm.rank;
            let fw = (me + 1) % 3;
            let bw = (me + 2) % 3;
            // Send own rank forward, receive the backward neighbor's.
            let got = comm.sendrecv_ints(fw, &[me as i64], bw, 1);
            got[0]
        });
        assert_eq!(out, vec![2, 0, 1]);
    }

    #[test]
    fn sendrecv2_both_modes_match() {
        for ordered in [false, true] {
            let out = spawn_ranks(2, move |mut comm| {
                comm.ordered_two_phase = ordered;
                let me = comm.rank;
                let other = 1 - me;
                let s_fw = vec![Rvec::new(me as f64, 0.0, 0.0)];
                let s_bw = vec![Rvec::new(10.0 + me as f64, 0.0, 0.0)];
                let (r_fw, r_bw) = comm.sendrecv2_vecs(other, other, &s_fw, &s_bw, 1, 1);
                (r_fw[0].x, r_bw[0].x)
            });
            // Forward traffic from the backward neighbor, and vice versa.
            assert_eq!(out[0], (1.0, 11.0));
            assert_eq!(out[1], (0.0, 10.0));
        }
    }

    #[test]
    fn gatherv_scatterv_roundtrip() {
        let out = spawn_ranks(3, |mut comm| {
            let me = comm.rank;
            let mine: Vec<i64> = (0..me + 1).map(|i| (10 * me + i) as i64).collect();
            let counts = [1usize, 2, 3];
            let gathered = comm.gatherv_ints(&mine, comm.is_master().then_some(&counts[..]));
            if comm.is_master() {
                let all = gathered.unwrap();
                assert_eq!(all, vec![0, 10, 11, 20, 21, 22]);
                comm.scatterv_ints(Some((&all, &counts)), counts[me])
            } else {
                comm.scatterv_ints(None, me + 1)
            }
        });
        assert_eq!(out[0], vec![0]);
        assert_eq!(out[1], vec![10, 11]);
        assert_eq!(out[2], vec![20, 21, 22]);
    }

    #[test]
    fn row_gather_and_bcast() {
        // One row of 3 ranks; root is member 0.
        let out = spawn_ranks(3, |mut comm| {
            let row = RowComm { members: vec![0, 1, 2], my_pos: comm.rank };
            let sbuf = [comm.rank as f64; 2];
            let gathered = comm.row_gather_reals(&row, &sbuf);
            let mut buf = if row.is_root() {
                let g = gathered.unwrap();
                assert_eq!(g, vec![0.0, 0.0, 1.0, 1.0, 2.0, 2.0]);
                vec![7.0, 8.0]
            } else {
                Vec::new()
            };
            comm.row_bcast_reals(&row, &mut buf);
            buf
        });
        for b in out {
            assert_eq!(b, vec![7.0, 8.0]);
        }
    }

    #[test]
    fn out_of_order_arrivals_are_parked() {
        let out = spawn_ranks(2, |mut comm| {
            if comm.rank == 0 {
                // Two messages on different lanes; receiver asks for the
                // second lane first.
                comm.send_ints(1, TAG_P2P, &[1]);
                comm.send_ints(1, TAG_P2P_BW, &[2]);
                0
            } else {
                let second = comm.recv_ints(0, TAG_P2P_BW);
                let first = comm.recv_ints(0, TAG_P2P);
                assert_eq!((first[0], second[0]), (1, 2));
                1
            }
        });
        assert_eq!(out.len(), 2);
    }
}
