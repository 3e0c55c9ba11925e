//! Binary codec for persisting the graph through the shared-memory
//! window.
//!
//! Everything is little-endian with fixed widths and no padding:
//! addresses and element counts are `u64`, instruction length, kind tag
//! and visit counts are `u32`, the closed flag is one byte. The encode
//! path is written once against a [`Sink`] and driven twice, first by a
//! byte counter and then by the window writer, so `mem_size` can never
//! drift from what `serialize_into` actually emits.

use crate::error::{Error, Result};
use crate::graph::FlowGraph;
use crate::instruction::{BranchKind, Instruction};
use crate::node::Node;

/// Default capacity of the CFG portion of the shared-memory region.
pub const DEFAULT_WINDOW_BYTES: usize = 8 * 1024;

/// Wire bytes of an instruction before its text: address, kind tag,
/// length, target and the text length prefix.
const INSTRUCTION_FIXED_BYTES: usize = 8 + 4 + 4 + 8 + 8;

/// Wire bytes of a node with an empty body: entry, iteration, body
/// count, closed flag, max visits, both successors and the visit count.
const NODE_FIXED_BYTES: usize = 8 + 8 + 8 + 1 + 8 + 8 + 8 + 4;

/// Smallest possible keyed node entry in the graph wire form.
const KEYED_NODE_MIN_BYTES: usize = 8 + NODE_FIXED_BYTES;

trait Sink {
    fn put_u8(&mut self, value: u8);
    fn put_u32(&mut self, value: u32);
    fn put_u64(&mut self, value: u64);
    fn put_bytes(&mut self, bytes: &[u8]);
}

/// Measures the byte count the encode path produces without writing.
#[derive(Default)]
struct ByteCounter {
    total: usize,
}

impl Sink for ByteCounter {
    fn put_u8(&mut self, _: u8) {
        self.total += 1;
    }

    fn put_u32(&mut self, _: u32) {
        self.total += 4;
    }

    fn put_u64(&mut self, _: u64) {
        self.total += 8;
    }

    fn put_bytes(&mut self, bytes: &[u8]) {
        self.total += bytes.len();
    }
}

/// Writes into a window already verified to be large enough.
struct WindowWriter<'a> {
    window: &'a mut [u8],
    pos: usize,
}

impl WindowWriter<'_> {
    fn put(&mut self, bytes: &[u8]) {
        self.window[self.pos..self.pos + bytes.len()].copy_from_slice(bytes);
        self.pos += bytes.len();
    }
}

impl Sink for WindowWriter<'_> {
    fn put_u8(&mut self, value: u8) {
        self.put(&[value]);
    }

    fn put_u32(&mut self, value: u32) {
        self.put(&value.to_le_bytes());
    }

    fn put_u64(&mut self, value: u64) {
        self.put(&value.to_le_bytes());
    }

    fn put_bytes(&mut self, bytes: &[u8]) {
        self.put(bytes);
    }
}

/// Consumes a window front to back, reporting truncation as corruption.
struct WindowReader<'a> {
    rest: &'a [u8],
}

impl<'a> WindowReader<'a> {
    fn new(window: &'a [u8]) -> Self {
        Self { rest: window }
    }

    fn remaining(&self) -> usize {
        self.rest.len()
    }

    fn take(&mut self, count: usize) -> Result<&'a [u8]> {
        if self.rest.len() < count {
            return Err(Error::CorruptBuffer("truncated cfg buffer"));
        }
        let (head, tail) = self.rest.split_at(count);
        self.rest = tail;
        Ok(head)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u32(&mut self) -> Result<u32> {
        let bytes = self.take(4)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn u64(&mut self) -> Result<u64> {
        let bytes = self.take(8)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(bytes);
        Ok(u64::from_le_bytes(raw))
    }
}

fn kind_tag(kind: BranchKind) -> u32 {
    match kind {
        BranchKind::None => 0,
        BranchKind::Call => 1,
        BranchKind::Return => 2,
        BranchKind::ConditionalJump => 3,
        BranchKind::UnconditionalJump => 4,
        BranchKind::Leave => 5,
    }
}

fn kind_from_tag(tag: u32) -> Option<BranchKind> {
    match tag {
        0 => Some(BranchKind::None),
        1 => Some(BranchKind::Call),
        2 => Some(BranchKind::Return),
        3 => Some(BranchKind::ConditionalJump),
        4 => Some(BranchKind::UnconditionalJump),
        5 => Some(BranchKind::Leave),
        _ => None,
    }
}

impl Instruction {
    fn encode<S: Sink>(&self, sink: &mut S) {
        sink.put_u64(self.address);
        sink.put_u32(kind_tag(self.kind));
        sink.put_u32(self.length);
        sink.put_u64(self.target);
        sink.put_u64(self.text.len() as u64);
        sink.put_bytes(self.text.as_bytes());
    }

    fn decode(reader: &mut WindowReader<'_>) -> Result<Self> {
        let address = reader.u64()?;
        let kind = kind_from_tag(reader.u32()?)
            .ok_or(Error::CorruptBuffer("unknown instruction kind tag"))?;
        let length = reader.u32()?;
        let target = reader.u64()?;

        let text_len = reader.u64()? as usize;
        if text_len > reader.remaining() {
            return Err(Error::CorruptBuffer("instruction text overruns buffer"));
        }
        let text = String::from_utf8(reader.take(text_len)?.to_vec())
            .map_err(|_| Error::CorruptBuffer("instruction text is not utf-8"))?;

        Ok(Self {
            address,
            text,
            kind,
            length,
            target,
            api_tag: None,
        })
    }

    /// Exact wire size of this record.
    pub fn mem_size(&self) -> usize {
        INSTRUCTION_FIXED_BYTES + self.text.len()
    }
}

impl Node {
    fn encode<S: Sink>(&self, sink: &mut S) {
        sink.put_u64(self.entry);
        sink.put_u64(self.iteration);
        sink.put_u64(self.body.len() as u64);
        for inst in &self.body {
            inst.encode(sink);
        }
        sink.put_u8(u8::from(self.closed));
        sink.put_u64(self.max_visits_in_graph);
        sink.put_u64(self.true_succ);
        sink.put_u64(self.false_succ);
        sink.put_u32(self.visits);
    }

    fn decode(reader: &mut WindowReader<'_>) -> Result<Self> {
        let entry = reader.u64()?;
        let iteration = reader.u64()?;

        let body_count = reader.u64()? as usize;
        if body_count > reader.remaining() / INSTRUCTION_FIXED_BYTES {
            return Err(Error::CorruptBuffer("impossible instruction count"));
        }
        let mut body = Vec::with_capacity(body_count);
        for _ in 0..body_count {
            body.push(Instruction::decode(reader)?);
        }

        let closed = match reader.u8()? {
            0 => false,
            1 => true,
            _ => return Err(Error::CorruptBuffer("closed flag is not a boolean")),
        };
        let max_visits_in_graph = reader.u64()?;
        let true_succ = reader.u64()?;
        let false_succ = reader.u64()?;
        let visits = reader.u32()?;

        Ok(Self {
            entry,
            iteration,
            body,
            closed,
            true_succ,
            false_succ,
            visits,
            max_visits_in_graph,
        })
    }

    /// Exact wire size of this node.
    pub fn mem_size(&self) -> usize {
        let mut counter = ByteCounter::default();
        self.encode(&mut counter);
        counter.total
    }

    /// Whether this node's wire form fits in `capacity` bytes.
    pub fn it_fits(&self, capacity: usize) -> bool {
        self.mem_size() <= capacity
    }
}

impl FlowGraph {
    /// Exact wire size of the whole graph.
    pub fn mem_size(&self) -> usize {
        let mut counter = ByteCounter::default();
        self.encode(&mut counter);
        counter.total
    }

    /// Whether the graph's wire form fits in `capacity` bytes.
    pub fn it_fits(&self, capacity: usize) -> bool {
        self.mem_size() <= capacity
    }

    /// Write the graph into the CFG window.
    ///
    /// Refuses windows smaller than [`FlowGraph::mem_size`]; nothing is
    /// written on refusal.
    pub fn serialize_into(&self, window: &mut [u8]) -> Result<()> {
        let needed = self.mem_size();
        if window.len() < needed {
            return Err(Error::WindowTooSmall {
                needed,
                capacity: window.len(),
            });
        }

        let mut writer = WindowWriter { window, pos: 0 };
        self.encode(&mut writer);
        Ok(())
    }

    /// Rebuild a graph from the CFG window.
    ///
    /// A zeroed window decodes to the empty graph, which is how the
    /// very first iteration finds a clean slate. The decoded graph
    /// carries no cursor state; it exists to be merged.
    pub fn deserialize_from(window: &[u8]) -> Result<Self> {
        let mut reader = WindowReader::new(window);

        let first_entry = reader.u64()?;
        let node_count = reader.u64()? as usize;
        if node_count > reader.remaining() / KEYED_NODE_MIN_BYTES {
            return Err(Error::CorruptBuffer("impossible node count"));
        }

        let mut graph = FlowGraph::new();
        graph.first_entry = first_entry;
        for _ in 0..node_count {
            let key = reader.u64()?;
            let node = Node::decode(&mut reader)?;
            graph.nodes.insert(key, node);
        }
        Ok(graph)
    }

    fn encode<S: Sink>(&self, sink: &mut S) {
        sink.put_u64(self.first_entry);
        sink.put_u64(self.nodes.len() as u64);
        for (key, node) in &self.nodes {
            sink.put_u64(*key);
            node.encode(sink);
        }
    }
}
