//! Input SSA graph model.
//!
//! The backend consumes an immutable graph of typed value nodes with
//! explicit memory edges, produced by the (external) middle end. Nodes and
//! blocks live in arenas keyed by id; edges are ids, never owning
//! references. Memory dependencies are ordinary predecessor edges carrying
//! `Mode::Memory`.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(pub u32);

impl NodeId {
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId(pub u32);

impl BlockId {
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Bit width and kind of the value a node produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// 8-bit integer (also the carrier for boolean values).
    Byte,
    /// 32-bit integer.
    Dword,
    /// 64-bit integer (pointers).
    Qword,
    /// Boolean produced by `Cmp`, consumed by `Cond`.
    Bool,
    /// Memory dependency.
    Memory,
    /// Multi-result nodes (`Start`, `Call`, `Div`, `Load`).
    Tuple,
    /// Control flow (`Jmp`, projections of `Cond`).
    Control,
}

impl Mode {
    pub fn is_value(self) -> bool {
        matches!(self, Mode::Byte | Mode::Dword | Mode::Qword)
    }
}

/// Comparison relation, as attached to `Cmp` nodes and two-way block exits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Relation {
    Equal,
    NotEqual,
    Less,
    LessEqual,
    Greater,
    GreaterEqual,
}

impl Relation {
    /// The relation that holds exactly when `self` does not.
    pub fn negated(self) -> Relation {
        match self {
            Relation::Equal => Relation::NotEqual,
            Relation::NotEqual => Relation::Equal,
            Relation::Less => Relation::GreaterEqual,
            Relation::LessEqual => Relation::Greater,
            Relation::Greater => Relation::LessEqual,
            Relation::GreaterEqual => Relation::Less,
        }
    }

    /// The relation that holds when `self` holds with swapped operands.
    pub fn mirrored(self) -> Relation {
        match self {
            Relation::Equal => Relation::Equal,
            Relation::NotEqual => Relation::NotEqual,
            Relation::Less => Relation::Greater,
            Relation::LessEqual => Relation::GreaterEqual,
            Relation::Greater => Relation::Less,
            Relation::GreaterEqual => Relation::LessEqual,
        }
    }
}

impl fmt::Display for Relation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Relation::Equal => "eq",
            Relation::NotEqual => "ne",
            Relation::Less => "lt",
            Relation::LessEqual => "le",
            Relation::Greater => "gt",
            Relation::GreaterEqual => "ge",
        };
        write!(f, "{}", s)
    }
}

/// Projection indices on multi-result nodes.
pub mod proj {
    /// Memory result of `Start`, `Call`, `Div`, `Mod`, `Load`, `Store`.
    pub const MEM: u32 = 0;
    /// Value result of `Call`, `Div`, `Mod`, `Load`; argument tuple of `Start`.
    pub const RES: u32 = 1;
    /// False branch of `Cond`.
    pub const COND_FALSE: u32 = 0;
    /// True branch of `Cond`.
    pub const COND_TRUE: u32 = 1;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeKind {
    Start,
    End,
    /// Signed integer constant.
    Const { value: i64 },
    /// Address of a global symbol; materialized only at use sites.
    Address { symbol: String },
    Add,
    Sub,
    Mul,
    And,
    Shl,
    Shr,
    Neg,
    /// Width conversion.
    Conv,
    /// Preds: `[mem, dividend, divisor]`; results via `Proj`.
    Div,
    /// Preds: `[mem, dividend, divisor]`; results via `Proj`.
    Mod,
    /// Preds: `[mem, ptr]`; value read via `Proj { RES }`.
    Load,
    /// Preds: `[mem, ptr, value]`.
    Store,
    /// Preds: `[mem, args...]`; callee resolved to a symbol upstream.
    Call { symbol: String },
    Cmp { relation: Relation },
    /// Preds: `[cmp]`; branch targets via `Proj { COND_TRUE/COND_FALSE }`.
    Cond,
    Proj { index: u32 },
    /// Preds aligned positionally with the owning block's predecessors.
    Phi,
    /// Preds: `[mem]` or `[mem, value]`.
    Return,
    /// Unconditional control transfer to the block listing it as pred.
    Jmp,
}

impl NodeKind {
    pub fn opcode(&self) -> &'static str {
        match self {
            NodeKind::Start => "Start",
            NodeKind::End => "End",
            NodeKind::Const { .. } => "Const",
            NodeKind::Address { .. } => "Address",
            NodeKind::Add => "Add",
            NodeKind::Sub => "Sub",
            NodeKind::Mul => "Mul",
            NodeKind::And => "And",
            NodeKind::Shl => "Shl",
            NodeKind::Shr => "Shr",
            NodeKind::Neg => "Neg",
            NodeKind::Conv => "Conv",
            NodeKind::Div => "Div",
            NodeKind::Mod => "Mod",
            NodeKind::Load => "Load",
            NodeKind::Store => "Store",
            NodeKind::Call { .. } => "Call",
            NodeKind::Cmp { .. } => "Cmp",
            NodeKind::Cond => "Cond",
            NodeKind::Proj { .. } => "Proj",
            NodeKind::Phi => "Phi",
            NodeKind::Return => "Return",
            NodeKind::Jmp => "Jmp",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Node {
    pub id: NodeId,
    pub kind: NodeKind,
    pub mode: Mode,
    pub block: BlockId,
    pub preds: Vec<NodeId>,
}

/// A basic block of the input graph.
///
/// `preds` are the control nodes transferring into this block (`Jmp`, or a
/// `Proj` on a `Cond`, or `Return` for the end block); `Phi` predecessors
/// align positionally with this list. `nodes` is the schedule: every node
/// placed in this block, in a valid topological order of the intra-block
/// data dependencies.
#[derive(Debug, Clone)]
pub struct IrBlock {
    pub id: BlockId,
    pub preds: Vec<NodeId>,
    pub nodes: Vec<NodeId>,
}

#[derive(Debug)]
pub struct Graph {
    pub name: String,
    pub n_args: u32,
    nodes: Vec<Node>,
    blocks: Vec<IrBlock>,
    pub entry: BlockId,
    pub end_block: BlockId,
}

impl Graph {
    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.index()]
    }

    pub fn block(&self, id: BlockId) -> &IrBlock {
        &self.blocks[id.index()]
    }

    pub fn blocks(&self) -> impl Iterator<Item = &IrBlock> {
        self.blocks.iter()
    }

    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    /// Predecessor blocks, in the order `Phi` predecessors are aligned with.
    pub fn pred_blocks(&self, id: BlockId) -> Vec<BlockId> {
        self.block(id)
            .preds
            .iter()
            .map(|ctrl| self.node(*ctrl).block)
            .collect()
    }

    /// Successor blocks, deduplicated, in block id order.
    pub fn succ_blocks(&self, id: BlockId) -> Vec<BlockId> {
        let mut succs = Vec::new();
        for block in &self.blocks {
            for ctrl in &block.preds {
                if self.node(*ctrl).block == id && !succs.contains(&block.id) {
                    succs.push(block.id);
                }
            }
        }
        succs.sort();
        succs
    }

    /// Phi nodes scheduled in `block`.
    pub fn phis_of(&self, block: BlockId) -> Vec<NodeId> {
        self.block(block)
            .nodes
            .iter()
            .copied()
            .filter(|n| matches!(self.node(*n).kind, NodeKind::Phi))
            .collect()
    }
}

// --- Builder ---

/// Constructs graphs for upstream lowering and for tests.
///
/// Nodes are appended to their block's schedule in creation order, which the
/// builder's callers must keep a topological order of the intra-block data
/// dependencies (creating operands before their users does this naturally).
pub struct GraphBuilder {
    name: String,
    n_args: u32,
    nodes: Vec<Node>,
    blocks: Vec<IrBlock>,
    current: BlockId,
    start: NodeId,
    end_block: BlockId,
}

impl GraphBuilder {
    pub fn new(name: impl Into<String>, n_args: u32) -> Self {
        let entry = IrBlock {
            id: BlockId(0),
            preds: vec![],
            nodes: vec![],
        };
        let end = IrBlock {
            id: BlockId(1),
            preds: vec![],
            nodes: vec![],
        };
        let mut builder = Self {
            name: name.into(),
            n_args,
            nodes: vec![],
            blocks: vec![entry, end],
            current: BlockId(0),
            start: NodeId(0),
            end_block: BlockId(1),
        };
        builder.start = builder.add_node(NodeKind::Start, Mode::Tuple, vec![]);
        builder
    }

    pub fn entry(&self) -> BlockId {
        BlockId(0)
    }

    pub fn end_block(&self) -> BlockId {
        self.end_block
    }

    pub fn new_block(&mut self) -> BlockId {
        let id = BlockId(self.blocks.len() as u32);
        self.blocks.push(IrBlock {
            id,
            preds: vec![],
            nodes: vec![],
        });
        id
    }

    pub fn set_current(&mut self, block: BlockId) {
        self.current = block;
    }

    fn add_node(&mut self, kind: NodeKind, mode: Mode, preds: Vec<NodeId>) -> NodeId {
        let id = NodeId(self.nodes.len() as u32);
        self.nodes.push(Node {
            id,
            kind,
            mode,
            block: self.current,
            preds,
        });
        self.blocks[self.current.index()].nodes.push(id);
        id
    }

    /// The initial memory state, a projection on `Start`.
    pub fn start_mem(&mut self) -> NodeId {
        let start = self.start;
        self.add_node(NodeKind::Proj { index: proj::MEM }, Mode::Memory, vec![start])
    }

    /// The `index`-th procedure argument.
    pub fn arg(&mut self, index: u32, mode: Mode) -> NodeId {
        let start = self.start;
        let args = self.add_node(NodeKind::Proj { index: proj::RES }, Mode::Tuple, vec![start]);
        self.add_node(NodeKind::Proj { index }, mode, vec![args])
    }

    pub fn const_(&mut self, mode: Mode, value: i64) -> NodeId {
        self.add_node(NodeKind::Const { value }, mode, vec![])
    }

    pub fn address(&mut self, symbol: impl Into<String>) -> NodeId {
        self.add_node(
            NodeKind::Address {
                symbol: symbol.into(),
            },
            Mode::Qword,
            vec![],
        )
    }

    pub fn binop(&mut self, kind: NodeKind, mode: Mode, left: NodeId, right: NodeId) -> NodeId {
        self.add_node(kind, mode, vec![left, right])
    }

    pub fn neg(&mut self, mode: Mode, value: NodeId) -> NodeId {
        self.add_node(NodeKind::Neg, mode, vec![value])
    }

    pub fn conv(&mut self, mode: Mode, value: NodeId) -> NodeId {
        self.add_node(NodeKind::Conv, mode, vec![value])
    }

    /// Division; returns `(div, quotient proj, mem proj)`.
    pub fn div(&mut self, mode: Mode, mem: NodeId, left: NodeId, right: NodeId) -> (NodeId, NodeId, NodeId) {
        let div = self.add_node(NodeKind::Div, Mode::Tuple, vec![mem, left, right]);
        let res = self.add_node(NodeKind::Proj { index: proj::RES }, mode, vec![div]);
        let mem = self.add_node(NodeKind::Proj { index: proj::MEM }, Mode::Memory, vec![div]);
        (div, res, mem)
    }

    /// Modulo; returns `(mod, remainder proj, mem proj)`.
    pub fn modulo(&mut self, mode: Mode, mem: NodeId, left: NodeId, right: NodeId) -> (NodeId, NodeId, NodeId) {
        let md = self.add_node(NodeKind::Mod, Mode::Tuple, vec![mem, left, right]);
        let res = self.add_node(NodeKind::Proj { index: proj::RES }, mode, vec![md]);
        let mem = self.add_node(NodeKind::Proj { index: proj::MEM }, Mode::Memory, vec![md]);
        (md, res, mem)
    }

    /// Load; returns `(value proj, mem proj)`.
    pub fn load(&mut self, mode: Mode, mem: NodeId, ptr: NodeId) -> (NodeId, NodeId) {
        let load = self.add_node(NodeKind::Load, Mode::Tuple, vec![mem, ptr]);
        let res = self.add_node(NodeKind::Proj { index: proj::RES }, mode, vec![load]);
        let mem = self.add_node(NodeKind::Proj { index: proj::MEM }, Mode::Memory, vec![load]);
        (res, mem)
    }

    /// Store; returns the new memory state.
    pub fn store(&mut self, mem: NodeId, ptr: NodeId, value: NodeId) -> NodeId {
        let store = self.add_node(NodeKind::Store, Mode::Tuple, vec![mem, ptr, value]);
        self.add_node(NodeKind::Proj { index: proj::MEM }, Mode::Memory, vec![store])
    }

    /// Call; returns `(result proj, mem proj)`. Void callees pass `None`
    /// as the result mode and get no result projection.
    pub fn call(
        &mut self,
        symbol: impl Into<String>,
        mem: NodeId,
        args: &[NodeId],
        result_mode: Option<Mode>,
    ) -> (Option<NodeId>, NodeId) {
        let mut preds = vec![mem];
        preds.extend_from_slice(args);
        let call = self.add_node(
            NodeKind::Call {
                symbol: symbol.into(),
            },
            Mode::Tuple,
            preds,
        );
        let res = result_mode
            .map(|mode| self.add_node(NodeKind::Proj { index: proj::RES }, mode, vec![call]));
        let mem = self.add_node(NodeKind::Proj { index: proj::MEM }, Mode::Memory, vec![call]);
        (res, mem)
    }

    pub fn cmp(&mut self, relation: Relation, left: NodeId, right: NodeId) -> NodeId {
        self.add_node(NodeKind::Cmp { relation }, Mode::Bool, vec![left, right])
    }

    /// Conditional exit of the current block.
    pub fn cond(&mut self, cmp: NodeId, true_target: BlockId, false_target: BlockId) {
        let cond = self.add_node(NodeKind::Cond, Mode::Tuple, vec![cmp]);
        let t = self.add_node(
            NodeKind::Proj {
                index: proj::COND_TRUE,
            },
            Mode::Control,
            vec![cond],
        );
        let f = self.add_node(
            NodeKind::Proj {
                index: proj::COND_FALSE,
            },
            Mode::Control,
            vec![cond],
        );
        self.blocks[true_target.index()].preds.push(t);
        self.blocks[false_target.index()].preds.push(f);
    }

    /// Unconditional exit of the current block.
    pub fn jmp(&mut self, target: BlockId) {
        let jmp = self.add_node(NodeKind::Jmp, Mode::Control, vec![]);
        self.blocks[target.index()].preds.push(jmp);
    }

    /// Phi in the current block; `inputs` align with the block's preds.
    pub fn phi(&mut self, mode: Mode, inputs: &[NodeId]) -> NodeId {
        self.add_node(NodeKind::Phi, mode, inputs.to_vec())
    }

    /// Replaces one predecessor edge. Loop phis are built with a
    /// placeholder input and patched once the back-edge value exists.
    pub fn set_pred(&mut self, node: NodeId, index: usize, pred: NodeId) {
        self.nodes[node.index()].preds[index] = pred;
    }

    pub fn ret(&mut self, mem: NodeId, value: Option<NodeId>) {
        let mut preds = vec![mem];
        preds.extend(value);
        let ret = self.add_node(NodeKind::Return, Mode::Control, preds);
        self.blocks[self.end_block.index()].preds.push(ret);
    }

    pub fn finish(mut self) -> Graph {
        let end_block = self.end_block;
        self.current = end_block;
        let end_preds = self.blocks[end_block.index()].preds.clone();
        self.add_node(NodeKind::End, Mode::Control, end_preds);
        Graph {
            name: self.name,
            n_args: self.n_args,
            nodes: self.nodes,
            blocks: self.blocks,
            entry: BlockId(0),
            end_block,
        }
    }
}
