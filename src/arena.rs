//! 参照カウント付きの構文木アリーナ。
//!
//! トップレベルのコマンド 1 つ分のノードを [`ArenaBuilder`] で組み立て、
//! [`ArenaHandle`] として凍結する。ノードの文字列はヒープのチャンクからバンプ割り当てし、
//! ハンドルの参照カウントが 0 になった時点でチャンクをまとめてヒープに返す。
//!
//! スレッドモードとネイティブ fork の子は木をコピーせず [`ArenaHandle::retain`] で共有する。
//! 凍結後のアリーナは不変なので、複数のコンテキストから同時に読んでも安全。
//! 疑似 fork ではヒープごと複製されるため、アリーナは [`OwnedNode`] として引き継ぐ。

use std::fmt;
use std::ptr::NonNull;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{trace, warn};

use crate::error::{Error, Result};
use crate::heap::Heap;

/// 文字列用チャンクの大きさ。
const ARENA_CHUNK: usize = 4096;

/// アリーナ内のノード番号。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(u32);

/// アリーナのチャンク上に置いた文字列。
#[derive(Clone, Copy)]
struct StrRef {
    ptr: NonNull<u8>,
    len: usize,
}

/// リダイレクトの種類。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RedirectKind {
    /// `n< file`
    Input,
    /// `n> file`
    Output,
    /// `n>> file`
    Append,
    /// `n>&m`
    Dup,
}

#[derive(Clone, Copy)]
struct RedirectData {
    fd: i32,
    kind: RedirectKind,
    target: StrRef,
}

#[derive(Clone)]
enum NodeData {
    Command {
        argv: Vec<StrRef>,
        redirects: Vec<RedirectData>,
    },
    Pipeline {
        commands: Vec<NodeId>,
    },
    Subshell {
        body: NodeId,
    },
    Sequence {
        items: Vec<(NodeId, bool)>,
    },
}

/// 1 回の構文解析結果を保持するブロック。凍結後は不変。
pub struct ArenaBlock {
    heap: Arc<Heap>,
    chunks: Vec<NonNull<u8>>,
    nodes: Vec<NodeData>,
}

// 凍結後は読み取り専用で、チャンクは drop まで解放されない。
unsafe impl Send for ArenaBlock {}
unsafe impl Sync for ArenaBlock {}

impl Drop for ArenaBlock {
    fn drop(&mut self) {
        for chunk in self.chunks.drain(..) {
            if let Err(e) = self.heap.free(chunk) {
                warn!(error = %e, "arena chunk release failed");
            }
        }
        trace!(nodes = self.nodes.len(), "arena released");
    }
}

impl ArenaBlock {
    fn str(&self, s: StrRef) -> &str {
        // チャンクは self が生きている間有効で、中身は &str からコピーした UTF-8。
        unsafe {
            std::str::from_utf8_unchecked(std::slice::from_raw_parts(s.ptr.as_ptr(), s.len))
        }
    }

    fn node(&self, id: NodeId) -> &NodeData {
        &self.nodes[id.0 as usize]
    }
}

// ── 構築 ─────────────────────────────────────────────────────────────

/// プロセス共有ヒープを使う新しいアリーナの構築を始める。
pub fn acquire_arena() -> ArenaBuilder {
    ArenaBuilder::new(Heap::global())
}

/// アリーナの組み立て。ノードは子から順に追加し、最後に [`finish`](Self::finish) する。
pub struct ArenaBuilder {
    heap: Arc<Heap>,
    chunks: Vec<NonNull<u8>>,
    /// 現在のチャンクの次の空き位置と残りバイト数。
    cursor: Option<(NonNull<u8>, usize)>,
    nodes: Vec<NodeData>,
}

impl ArenaBuilder {
    pub fn new(heap: Arc<Heap>) -> Self {
        Self {
            heap,
            chunks: Vec::new(),
            cursor: None,
            nodes: Vec::new(),
        }
    }

    fn intern(&mut self, s: &str) -> Result<StrRef> {
        let len = s.len();
        if len == 0 {
            return Ok(StrRef {
                ptr: NonNull::dangling(),
                len: 0,
            });
        }
        let dst = match self.cursor {
            Some((ptr, left)) if left >= len => {
                // ptr + len はチャンク内に収まる。
                let next = unsafe { NonNull::new_unchecked(ptr.as_ptr().add(len)) };
                self.cursor = Some((next, left - len));
                ptr
            }
            _ if len > ARENA_CHUNK / 2 => {
                // 大きな文字列は専用ブロックにして、現在のチャンクの残りを捨てない。
                let block = self.heap.alloc(len)?;
                self.chunks.push(block);
                block
            }
            _ => {
                let chunk = self.heap.alloc(ARENA_CHUNK)?;
                self.chunks.push(chunk);
                let next = unsafe { NonNull::new_unchecked(chunk.as_ptr().add(len)) };
                self.cursor = Some((next, ARENA_CHUNK - len));
                chunk
            }
        };
        unsafe { std::ptr::copy_nonoverlapping(s.as_ptr(), dst.as_ptr(), len) };
        Ok(StrRef { ptr: dst, len })
    }

    fn push(&mut self, node: NodeData) -> NodeId {
        self.nodes.push(node);
        NodeId((self.nodes.len() - 1) as u32)
    }

    fn check_id(&self, id: NodeId) -> Result<()> {
        if (id.0 as usize) < self.nodes.len() {
            Ok(())
        } else {
            Err(Error::internal(format!("unknown arena node {}", id.0)))
        }
    }

    /// 単純コマンド。
    pub fn command(&mut self, argv: &[&str], redirects: &[Redirect]) -> Result<NodeId> {
        let argv = argv
            .iter()
            .map(|a| self.intern(a))
            .collect::<Result<Vec<_>>>()?;
        let redirects = redirects
            .iter()
            .map(|r| {
                Ok(RedirectData {
                    fd: r.fd,
                    kind: r.kind,
                    target: self.intern(&r.target)?,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(self.push(NodeData::Command { argv, redirects }))
    }

    /// パイプライン。要素は 1 つ以上。
    pub fn pipeline(&mut self, commands: Vec<NodeId>) -> Result<NodeId> {
        if commands.is_empty() {
            return Err(Error::internal("empty pipeline"));
        }
        for &c in &commands {
            self.check_id(c)?;
        }
        Ok(self.push(NodeData::Pipeline { commands }))
    }

    /// `( body )`
    pub fn subshell(&mut self, body: NodeId) -> Result<NodeId> {
        self.check_id(body)?;
        Ok(self.push(NodeData::Subshell { body }))
    }

    /// `a; b & c` のような並び。`bool` はバックグラウンド実行か。
    pub fn sequence(&mut self, items: Vec<(NodeId, bool)>) -> Result<NodeId> {
        for &(n, _) in &items {
            self.check_id(n)?;
        }
        Ok(self.push(NodeData::Sequence { items }))
    }

    /// `root` を根として凍結する。参照カウントは 1。
    pub fn finish(mut self, root: NodeId) -> Result<ArenaHandle> {
        self.check_id(root)?;
        let block = ArenaBlock {
            heap: Arc::clone(&self.heap),
            chunks: std::mem::take(&mut self.chunks),
            nodes: std::mem::take(&mut self.nodes),
        };
        trace!(nodes = block.nodes.len(), chunks = block.chunks.len(), "arena frozen");
        Ok(ArenaHandle {
            block: Arc::new(block),
            root,
        })
    }
}

impl Drop for ArenaBuilder {
    fn drop(&mut self) {
        // finish されずに捨てられた場合。
        for chunk in self.chunks.drain(..) {
            let _ = self.heap.free(chunk);
        }
    }
}

// ── 参照 ─────────────────────────────────────────────────────────────

/// 凍結済みアリーナへの参照カウント付きハンドル。
///
/// 根は木全体とは限らない。[`NodeRef::share`] で同じアリーナの一部を指すハンドルを作れる。
#[derive(Clone)]
pub struct ArenaHandle {
    block: Arc<ArenaBlock>,
    root: NodeId,
}

impl fmt::Debug for ArenaHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ArenaHandle")
            .field("refcount", &self.refcount())
            .field("command", &self.root().command_text())
            .finish()
    }
}

impl ArenaHandle {
    /// 参照カウントを 1 増やしたハンドルを返す。
    pub fn retain(&self) -> ArenaHandle {
        self.clone()
    }

    /// 参照カウントを 1 減らす。0 になればチャンクをヒープに返す。
    pub fn release(self) {
        drop(self);
    }

    pub fn refcount(&self) -> usize {
        Arc::strong_count(&self.block)
    }

    pub fn root(&self) -> NodeRef<'_> {
        NodeRef {
            arena: &self.block,
            id: self.root,
        }
    }

    /// 同じアリーナを指していれば `true`。
    pub fn same_arena(&self, other: &ArenaHandle) -> bool {
        Arc::ptr_eq(&self.block, &other.block)
    }

    /// 所有型の木に変換する。
    pub fn to_owned_node(&self) -> OwnedNode {
        self.root().to_owned_node()
    }

    /// 所有型の木から新しいアリーナを組み立てる。
    pub fn from_owned(heap: Arc<Heap>, node: &OwnedNode) -> Result<ArenaHandle> {
        let mut b = ArenaBuilder::new(heap);
        let root = build_owned(&mut b, node)?;
        b.finish(root)
    }
}

fn build_owned(b: &mut ArenaBuilder, node: &OwnedNode) -> Result<NodeId> {
    match node {
        OwnedNode::Command { argv, redirects } => {
            let argv: Vec<&str> = argv.iter().map(String::as_str).collect();
            b.command(&argv, redirects)
        }
        OwnedNode::Pipeline(cmds) => {
            let ids = cmds
                .iter()
                .map(|c| build_owned(b, c))
                .collect::<Result<Vec<_>>>()?;
            b.pipeline(ids)
        }
        OwnedNode::Subshell(body) => {
            let id = build_owned(b, body)?;
            b.subshell(id)
        }
        OwnedNode::Sequence(items) => {
            let ids = items
                .iter()
                .map(|(n, bg)| Ok((build_owned(b, n)?, *bg)))
                .collect::<Result<Vec<_>>>()?;
            b.sequence(ids)
        }
    }
}

/// アリーナ内のノードへの参照。
#[derive(Clone, Copy)]
pub struct NodeRef<'a> {
    arena: &'a Arc<ArenaBlock>,
    id: NodeId,
}

impl fmt::Debug for NodeRef<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeRef({:?}: {})", self.id, self.command_text())
    }
}

/// リダイレクト（構築時の入力と参照時の表示を兼ねる）。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Redirect {
    pub fd: i32,
    pub kind: RedirectKind,
    pub target: String,
}

/// ノードの中身。
#[derive(Debug)]
pub enum NodeKind<'a> {
    Command {
        argv: Vec<&'a str>,
        redirects: Vec<Redirect>,
    },
    Pipeline(Vec<NodeRef<'a>>),
    Subshell(NodeRef<'a>),
    Sequence(Vec<(NodeRef<'a>, bool)>),
}

impl<'a> NodeRef<'a> {
    pub fn id(&self) -> NodeId {
        self.id
    }

    /// このノードを根とするハンドル。アリーナの参照カウントを 1 増やす。
    ///
    /// パイプラインの各要素など、木の一部だけを子に評価させるときに使う。
    pub fn share(&self) -> ArenaHandle {
        ArenaHandle {
            block: Arc::clone(self.arena),
            root: self.id,
        }
    }

    fn at(&self, id: NodeId) -> NodeRef<'a> {
        NodeRef {
            arena: self.arena,
            id,
        }
    }

    pub fn kind(&self) -> NodeKind<'a> {
        let arena = self.arena;
        match arena.node(self.id) {
            NodeData::Command { argv, redirects } => NodeKind::Command {
                argv: argv.iter().map(|&s| arena.str(s)).collect(),
                redirects: redirects
                    .iter()
                    .map(|r| Redirect {
                        fd: r.fd,
                        kind: r.kind,
                        target: arena.str(r.target).to_string(),
                    })
                    .collect(),
            },
            NodeData::Pipeline { commands } => {
                NodeKind::Pipeline(commands.iter().map(|&c| self.at(c)).collect())
            }
            NodeData::Subshell { body } => NodeKind::Subshell(self.at(*body)),
            NodeData::Sequence { items } => {
                NodeKind::Sequence(items.iter().map(|&(n, bg)| (self.at(n), bg)).collect())
            }
        }
    }

    /// ジョブ表示用のコマンド文字列。
    pub fn command_text(&self) -> String {
        let mut out = String::new();
        self.render(&mut out);
        out
    }

    fn render(&self, out: &mut String) {
        match self.kind() {
            NodeKind::Command { argv, redirects } => {
                out.push_str(&argv.join(" "));
                for r in redirects {
                    if !out.is_empty() {
                        out.push(' ');
                    }
                    out.push_str(&r.to_string());
                }
            }
            NodeKind::Pipeline(cmds) => {
                for (i, c) in cmds.iter().enumerate() {
                    if i > 0 {
                        out.push_str(" | ");
                    }
                    c.render(out);
                }
            }
            NodeKind::Subshell(body) => {
                out.push_str("( ");
                body.render(out);
                out.push_str(" )");
            }
            NodeKind::Sequence(items) => {
                let n = items.len();
                for (i, (item, bg)) in items.iter().enumerate() {
                    item.render(out);
                    if *bg {
                        out.push_str(" &");
                    } else if i + 1 < n {
                        out.push(';');
                    }
                    if i + 1 < n {
                        out.push(' ');
                    }
                }
            }
        }
    }

    pub fn to_owned_node(&self) -> OwnedNode {
        match self.kind() {
            NodeKind::Command { argv, redirects } => OwnedNode::Command {
                argv: argv.into_iter().map(str::to_string).collect(),
                redirects,
            },
            NodeKind::Pipeline(cmds) => {
                OwnedNode::Pipeline(cmds.iter().map(NodeRef::to_owned_node).collect())
            }
            NodeKind::Subshell(body) => OwnedNode::Subshell(Box::new(body.to_owned_node())),
            NodeKind::Sequence(items) => OwnedNode::Sequence(
                items
                    .iter()
                    .map(|(n, bg)| (n.to_owned_node(), *bg))
                    .collect(),
            ),
        }
    }
}

impl fmt::Display for Redirect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (default_fd, op) = match self.kind {
            RedirectKind::Input => (0, "<"),
            RedirectKind::Output => (1, ">"),
            RedirectKind::Append => (1, ">>"),
            RedirectKind::Dup => (1, ">&"),
        };
        if self.fd != default_fd {
            write!(f, "{}", self.fd)?;
        }
        write!(f, "{}{}", op, self.target)
    }
}

/// 所有型の構文木。プロセス境界を越えて渡すときに使う。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OwnedNode {
    Command {
        argv: Vec<String>,
        redirects: Vec<Redirect>,
    },
    Pipeline(Vec<OwnedNode>),
    Subshell(Box<OwnedNode>),
    Sequence(Vec<(OwnedNode, bool)>),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::DEFAULT_MIN_CHUNK;
    use pretty_assertions::assert_eq;

    fn sample(heap: &Arc<Heap>) -> ArenaHandle {
        let mut b = ArenaBuilder::new(Arc::clone(heap));
        let ls = b.command(&["ls", "-l"], &[]).unwrap();
        let wc = b
            .command(
                &["wc", "-l"],
                &[Redirect {
                    fd: 1,
                    kind: RedirectKind::Output,
                    target: "out.txt".into(),
                }],
            )
            .unwrap();
        let pipe = b.pipeline(vec![ls, wc]).unwrap();
        let sleep = b.command(&["sleep", "1"], &[]).unwrap();
        let sub = b.subshell(sleep).unwrap();
        let seq = b.sequence(vec![(pipe, false), (sub, true)]).unwrap();
        b.finish(seq).unwrap()
    }

    #[test]
    fn command_text_renders_tree() {
        let heap = Arc::new(Heap::new(DEFAULT_MIN_CHUNK));
        let arena = sample(&heap);
        assert_eq!(
            arena.root().command_text(),
            "ls -l | wc -l >out.txt; ( sleep 1 ) &"
        );
    }

    #[test]
    fn kinds_expose_structure() {
        let heap = Arc::new(Heap::new(DEFAULT_MIN_CHUNK));
        let arena = sample(&heap);
        let NodeKind::Sequence(items) = arena.root().kind() else {
            panic!("expected sequence");
        };
        assert_eq!(items.len(), 2);
        let NodeKind::Pipeline(cmds) = items[0].0.kind() else {
            panic!("expected pipeline");
        };
        match cmds[1].kind() {
            NodeKind::Command { argv, redirects } => {
                assert_eq!(argv, vec!["wc", "-l"]);
                assert_eq!(redirects[0].target, "out.txt");
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(items[1].1);
    }

    #[test]
    fn refcount_and_release_free_chunks() {
        let heap = Arc::new(Heap::new(DEFAULT_MIN_CHUNK));
        let arena = sample(&heap);
        assert!(heap.stats().live_blocks > 0);
        let shared = arena.retain();
        assert_eq!(arena.refcount(), 2);
        assert!(shared.same_arena(&arena));
        arena.release();
        assert_eq!(shared.refcount(), 1);
        assert!(heap.stats().live_blocks > 0);
        shared.release();
        assert_eq!(heap.stats().live_blocks, 0);
        heap.check().unwrap();
    }

    #[test]
    fn shared_across_threads() {
        let heap = Arc::new(Heap::new(DEFAULT_MIN_CHUNK));
        let arena = sample(&heap);
        let child = arena.retain();
        let text = std::thread::spawn(move || child.root().command_text())
            .join()
            .unwrap();
        assert_eq!(text, arena.root().command_text());
        assert_eq!(arena.refcount(), 1);
    }

    #[test]
    fn owned_form_rebuilds_identical_tree() {
        let heap = Arc::new(Heap::new(DEFAULT_MIN_CHUNK));
        let arena = sample(&heap);
        let owned = arena.to_owned_node();
        let json = serde_json::to_string(&owned).unwrap();
        let back: OwnedNode = serde_json::from_str(&json).unwrap();
        let rebuilt = ArenaHandle::from_owned(Arc::clone(&heap), &back).unwrap();
        assert_eq!(rebuilt.to_owned_node(), owned);
        assert!(!rebuilt.same_arena(&arena));
    }

    #[test]
    fn long_strings_get_their_own_block() {
        let heap = Arc::new(Heap::new(DEFAULT_MIN_CHUNK));
        let long = "x".repeat(10_000);
        let mut b = ArenaBuilder::new(Arc::clone(&heap));
        let c = b.command(&["echo", &long], &[]).unwrap();
        let arena = b.finish(c).unwrap();
        match arena.root().kind() {
            NodeKind::Command { argv, .. } => assert_eq!(argv[1].len(), 10_000),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn subtree_shares_the_block() {
        let heap = Arc::new(Heap::new(DEFAULT_MIN_CHUNK));
        let arena = sample(&heap);
        let NodeKind::Sequence(items) = arena.root().kind() else {
            panic!("expected sequence");
        };
        let sub = items[1].0.share();
        assert!(sub.same_arena(&arena));
        assert_eq!(arena.refcount(), 2);
        assert_eq!(sub.root().command_text(), "( sleep 1 )");
        drop(items);
        drop(arena);
        assert_eq!(sub.refcount(), 1);
        assert!(heap.stats().live_blocks > 0);
    }

    #[test]
    fn unknown_node_rejected() {
        let heap = Arc::new(Heap::new(DEFAULT_MIN_CHUNK));
        let mut b = ArenaBuilder::new(heap);
        assert!(b.subshell(NodeId(7)).is_err());
        assert!(b.pipeline(vec![]).is_err());
    }
}
