//! fork 模倣用のヒープアロケータ。
//!
//! OS から直接マップした大きな領域（チャンク）をブロックに切り分けて貸し出す。
//! 通常の用途には `std` のアロケータで十分だが、このヒープはチャンクの中身を
//! 別プロセスの**同じアドレス**へそのまま複製できる。疑似 fork はこれを使い、
//! ポインタを含むデータ構造を変換なしで子に引き継ぐ。
//!
//! ## 構成
//!
//! ブロックのメタデータはチャンクの中には置かず、チャンクごとのサイドテーブル
//! （オフセット → ブロック、空きブロックの `(サイズ, オフセット)` 集合）で管理する。
//! チャンク内のバイトは必ずちょうど 1 つのブロックに属し、隣接する空きブロックは
//! 解放時に必ず結合される。
//!
//! 割り当ては全チャンクを通した best-fit。見つからなければ新しいチャンクをマップする。
//! すべての操作は 1 つのミューテックスで直列化する。
//!
//! 子への複製には [`Heap::snapshot_chunks`]（中身ごと）と [`Heap::layout`]（メタデータのみ）を使う。
//! 子側は [`Heap::restore`]（自分で同じアドレスにマップして書き込む）か
//! [`Heap::adopt_mapped`]（親がすでに書き込んだ領域を引き取る）でヒープを再構成する。

use std::collections::{BTreeMap, BTreeSet};
use std::ptr::NonNull;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::error::{Error, Result};
use crate::native;

/// ブロックの配置境界。
pub const ALIGN: usize = 16;

/// 分割後の残りがこれ未満なら分割せずに丸ごと渡す。
const MIN_SPLIT: usize = 32;

/// チャンクサイズの丸め単位（Windows の割り当て粒度に合わせる）。
const CHUNK_GRANULARITY: usize = 64 * 1024;

/// 既定の最小チャンクサイズ。
pub const DEFAULT_MIN_CHUNK: usize = 64 * 1024;

/// `n` を `to` の倍数に切り上げる。`usize` に収まらなければ `OutOfMemory`。
fn round_up(n: usize, to: usize) -> Result<usize> {
    n.div_ceil(to)
        .checked_mul(to)
        .ok_or(Error::OutOfMemory { requested: n })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
struct BlockInfo {
    size: usize,
    free: bool,
}

struct Chunk {
    base: NonNull<u8>,
    size: usize,
    blocks: BTreeMap<usize, BlockInfo>,
    free: BTreeSet<(usize, usize)>,
}

impl Chunk {
    fn fresh(base: NonNull<u8>, size: usize) -> Self {
        let mut chunk = Chunk {
            base,
            size,
            blocks: BTreeMap::new(),
            free: BTreeSet::new(),
        };
        chunk.blocks.insert(0, BlockInfo { size, free: true });
        chunk.free.insert((size, 0));
        chunk
    }

    fn from_layout(base: NonNull<u8>, layout: &ChunkLayout) -> Result<Self> {
        let mut chunk = Chunk {
            base,
            size: layout.size,
            blocks: BTreeMap::new(),
            free: BTreeSet::new(),
        };
        for b in &layout.blocks {
            chunk.blocks.insert(
                b.offset,
                BlockInfo {
                    size: b.size,
                    free: b.free,
                },
            );
            if b.free {
                chunk.free.insert((b.size, b.offset));
            }
        }
        chunk.check()?;
        Ok(chunk)
    }

    fn addr(&self) -> usize {
        self.base.as_ptr() as usize
    }

    fn is_empty(&self) -> bool {
        self.blocks.len() == 1 && self.free.len() == 1
    }

    /// `size` 以上で最小の空きブロック。
    fn best_fit(&self, size: usize) -> Option<(usize, usize)> {
        self.free.range((size, 0)..).next().copied()
    }

    /// 空きブロック `(bsize, off)` から `size` バイトを切り出して使用中にする。
    fn carve(&mut self, off: usize, bsize: usize, size: usize) {
        self.free.remove(&(bsize, off));
        if bsize - size >= MIN_SPLIT {
            self.blocks.insert(off, BlockInfo { size, free: false });
            let rest = off + size;
            self.blocks.insert(
                rest,
                BlockInfo {
                    size: bsize - size,
                    free: true,
                },
            );
            self.free.insert((bsize - size, rest));
        } else {
            self.blocks.insert(
                off,
                BlockInfo {
                    size: bsize,
                    free: false,
                },
            );
        }
    }

    /// `off` のブロックを空きにし、前後の空きブロックと結合する。
    fn release(&mut self, off: usize) -> Result<usize> {
        let info = match self.blocks.get(&off) {
            Some(b) if !b.free => *b,
            Some(_) => return Err(Error::internal(format!("double free at {:#x}", self.addr() + off))),
            None => {
                return Err(Error::internal(format!(
                    "free of non-block address {:#x}",
                    self.addr() + off
                )))
            }
        };
        let mut start = off;
        let mut size = info.size;

        let next = off + size;
        if let Some(n) = self.blocks.get(&next).copied().filter(|b| b.free) {
            self.free.remove(&(n.size, next));
            self.blocks.remove(&next);
            size += n.size;
        }
        if let Some((&poff, &p)) = self.blocks.range(..off).next_back() {
            if p.free {
                self.free.remove(&(p.size, poff));
                self.blocks.remove(&off);
                start = poff;
                size += p.size;
            }
        }
        self.blocks.insert(start, BlockInfo { size, free: true });
        self.free.insert((size, start));
        Ok(info.size)
    }

    /// 使用中ブロックを `new_size` に縮める。余りが小さければ何もしない。
    fn shrink(&mut self, off: usize, cur: usize, new_size: usize) {
        if cur - new_size < MIN_SPLIT {
            return;
        }
        self.blocks.insert(
            off,
            BlockInfo {
                size: new_size,
                free: false,
            },
        );
        let tail = off + new_size;
        self.blocks.insert(
            tail,
            BlockInfo {
                size: cur - new_size,
                free: false,
            },
        );
        // 後続の空きブロックとの結合は release に任せる。
        let _ = self.release(tail);
    }

    /// 直後の空きブロックを取り込んで `new_size` 以上に伸ばせれば伸ばす。
    fn grow_in_place(&mut self, off: usize, cur: usize, new_size: usize) -> bool {
        let next = off + cur;
        let n = match self.blocks.get(&next).copied() {
            Some(n) if n.free && cur + n.size >= new_size => n,
            _ => return false,
        };
        self.free.remove(&(n.size, next));
        self.blocks.remove(&next);
        let total = cur + n.size;
        self.blocks.insert(off, BlockInfo { size: total, free: true });
        self.free.insert((total, off));
        self.carve(off, total, new_size);
        true
    }

    fn check(&self) -> Result<()> {
        let mut expect = 0;
        let mut prev_free = false;
        let mut free_bytes = 0;
        for (&off, b) in &self.blocks {
            if off != expect {
                return Err(Error::internal(format!(
                    "chunk {:#x}: gap or overlap at offset {:#x}",
                    self.addr(),
                    off
                )));
            }
            if b.size == 0 || b.size % ALIGN != 0 {
                return Err(Error::internal(format!(
                    "chunk {:#x}: bad block size {} at {:#x}",
                    self.addr(),
                    b.size,
                    off
                )));
            }
            if b.free {
                if prev_free {
                    return Err(Error::internal(format!(
                        "chunk {:#x}: uncoalesced free blocks at {:#x}",
                        self.addr(),
                        off
                    )));
                }
                if !self.free.contains(&(b.size, off)) {
                    return Err(Error::internal(format!(
                        "chunk {:#x}: free block {:#x} missing from free set",
                        self.addr(),
                        off
                    )));
                }
                free_bytes += b.size;
            }
            prev_free = b.free;
            expect = off + b.size;
        }
        if expect != self.size {
            return Err(Error::internal(format!(
                "chunk {:#x}: blocks cover {} of {} bytes",
                self.addr(),
                expect,
                self.size
            )));
        }
        let listed: usize = self.free.iter().map(|&(s, _)| s).sum();
        if listed != free_bytes || listed > self.size {
            return Err(Error::internal(format!(
                "chunk {:#x}: free set holds {} bytes, blocks say {}",
                self.addr(),
                listed,
                free_bytes
            )));
        }
        Ok(())
    }

    fn layout(&self) -> ChunkLayout {
        ChunkLayout {
            addr: self.addr(),
            size: self.size,
            blocks: self
                .blocks
                .iter()
                .map(|(&offset, b)| BlockLayout {
                    offset,
                    size: b.size,
                    free: b.free,
                })
                .collect(),
        }
    }
}

struct HeapInner {
    /// ベースアドレス → チャンク。
    chunks: BTreeMap<usize, Chunk>,
    min_chunk: usize,
}

// チャンクのポインタは OS がマップした領域を指し、アクセスはすべてミューテックス越し。
unsafe impl Send for HeapInner {}

impl HeapInner {
    /// `addr` を含むチャンクとチャンク内オフセット。
    fn locate(&mut self, addr: usize) -> Result<(&mut Chunk, usize)> {
        match self.chunks.range_mut(..=addr).next_back() {
            Some((&base, chunk)) if addr < base + chunk.size => Ok((chunk, addr - base)),
            _ => Err(Error::internal(format!(
                "pointer {:#x} does not belong to the heap",
                addr
            ))),
        }
    }

    fn unmap_all(&mut self) {
        for (_, chunk) in std::mem::take(&mut self.chunks) {
            unsafe { native::unmap_region(chunk.base, chunk.size) };
        }
    }
}

/// 1 ブロック分の配置情報。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockLayout {
    pub offset: usize,
    pub size: usize,
    pub free: bool,
}

/// チャンクのメタデータ。子へ引き継ぐときに使う。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkLayout {
    pub addr: usize,
    pub size: usize,
    pub blocks: Vec<BlockLayout>,
}

/// チャンクのメタデータと中身。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkImage {
    pub layout: ChunkLayout,
    pub bytes: Vec<u8>,
}

/// ヒープの使用状況。
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeapStats {
    pub chunks: usize,
    pub mapped_bytes: usize,
    pub free_bytes: usize,
    pub live_blocks: usize,
}

/// チャンク単位のヒープ。
pub struct Heap {
    inner: Mutex<HeapInner>,
}

impl std::fmt::Debug for Heap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Heap").field("stats", &self.stats()).finish()
    }
}

impl Heap {
    pub fn new(min_chunk: usize) -> Self {
        Self {
            inner: Mutex::new(HeapInner {
                chunks: BTreeMap::new(),
                min_chunk: min_chunk.max(CHUNK_GRANULARITY),
            }),
        }
    }

    /// プロセス全体で共有するヒープ。疑似 fork はこのヒープを子に複製する。
    pub fn global() -> Arc<Heap> {
        static GLOBAL: OnceLock<Arc<Heap>> = OnceLock::new();
        Arc::clone(GLOBAL.get_or_init(|| Arc::new(Heap::new(DEFAULT_MIN_CHUNK))))
    }

    fn lock(&self) -> MutexGuard<'_, HeapInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// `size` バイト以上のブロックを確保する。先頭は [`ALIGN`] 境界。
    pub fn alloc(&self, size: usize) -> Result<NonNull<u8>> {
        let need = round_up(size.max(1), ALIGN)?;
        let mut inner = self.lock();

        let best = inner
            .chunks
            .iter()
            .filter_map(|(&base, c)| c.best_fit(need).map(|(s, off)| (s, base, off)))
            .min();
        let (bsize, base, off) = match best {
            Some(hit) => hit,
            None => {
                let chunk_size = round_up(need.max(inner.min_chunk), CHUNK_GRANULARITY)?;
                let ptr = native::map_region(chunk_size).map_err(|e| {
                    debug!(size = chunk_size, errno = %e, "chunk mapping failed");
                    Error::OutOfMemory { requested: size }
                })?;
                let base = ptr.as_ptr() as usize;
                debug!(addr = base, size = chunk_size, "heap chunk mapped");
                inner.chunks.insert(base, Chunk::fresh(ptr, chunk_size));
                (chunk_size, base, 0)
            }
        };
        let chunk = inner
            .chunks
            .get_mut(&base)
            .ok_or_else(|| Error::internal("chunk vanished during alloc"))?;
        chunk.carve(off, bsize, need);
        let addr = base + off;
        trace!(addr, size = need, "alloc");
        // base は NonNull 由来で off はチャンク内。
        NonNull::new(addr as *mut u8).ok_or_else(|| Error::internal("null block address"))
    }

    /// ブロックを解放する。ヒープ外のポインタや二重解放は内部エラー。
    pub fn free(&self, ptr: NonNull<u8>) -> Result<()> {
        let addr = ptr.as_ptr() as usize;
        let mut inner = self.lock();
        let (chunk, off) = inner.locate(addr)?;
        let size = chunk.release(off)?;
        trace!(addr, size, "free");
        Ok(())
    }

    /// ブロックの大きさを変える。可能ならその場で伸縮し、無理なら移して中身をコピーする。
    pub fn realloc(&self, ptr: NonNull<u8>, new_size: usize) -> Result<NonNull<u8>> {
        let need = round_up(new_size.max(1), ALIGN)?;
        let addr = ptr.as_ptr() as usize;
        let cur = {
            let mut inner = self.lock();
            let (chunk, off) = inner.locate(addr)?;
            let cur = match chunk.blocks.get(&off) {
                Some(b) if !b.free => b.size,
                _ => return Err(Error::internal(format!("realloc of non-live block {:#x}", addr))),
            };
            if need <= cur {
                chunk.shrink(off, cur, need);
                return Ok(ptr);
            }
            if chunk.grow_in_place(off, cur, need) {
                trace!(addr, from = cur, to = need, "realloc in place");
                return Ok(ptr);
            }
            cur
        };
        let new = self.alloc(need)?;
        unsafe { std::ptr::copy_nonoverlapping(ptr.as_ptr(), new.as_ptr(), cur) };
        self.free(ptr)?;
        trace!(from = addr, to = new.as_ptr() as usize, size = need, "realloc moved");
        Ok(new)
    }

    /// 使用中ブロックの実際の大きさ。
    pub fn block_size(&self, ptr: NonNull<u8>) -> Result<usize> {
        let addr = ptr.as_ptr() as usize;
        let mut inner = self.lock();
        let (chunk, off) = inner.locate(addr)?;
        match chunk.blocks.get(&off) {
            Some(b) if !b.free => Ok(b.size),
            _ => Err(Error::internal(format!("{:#x} is not a live block", addr))),
        }
    }

    /// `addr` がこのヒープのチャンク内を指していれば `true`。
    pub fn contains(&self, addr: usize) -> bool {
        self.lock().locate(addr).is_ok()
    }

    pub fn stats(&self) -> HeapStats {
        let inner = self.lock();
        let mut stats = HeapStats {
            chunks: inner.chunks.len(),
            ..HeapStats::default()
        };
        for c in inner.chunks.values() {
            stats.mapped_bytes += c.size;
            stats.free_bytes += c.free.iter().map(|&(s, _)| s).sum::<usize>();
            stats.live_blocks += c.blocks.values().filter(|b| !b.free).count();
        }
        stats
    }

    /// 全チャンクの整合性を検査する。
    pub fn check(&self) -> Result<()> {
        let inner = self.lock();
        inner.chunks.values().try_for_each(Chunk::check)
    }

    /// 完全に空いたチャンクを OS に返す。返したバイト数を返す。
    pub fn trim(&self) -> usize {
        let mut inner = self.lock();
        let empty: Vec<usize> = inner
            .chunks
            .iter()
            .filter(|(_, c)| c.is_empty())
            .map(|(&b, _)| b)
            .collect();
        let mut released = 0;
        for base in empty {
            if let Some(chunk) = inner.chunks.remove(&base) {
                released += chunk.size;
                unsafe { native::unmap_region(chunk.base, chunk.size) };
            }
        }
        if released > 0 {
            debug!(bytes = released, "heap trimmed");
        }
        released
    }

    /// 全チャンクのメタデータ（中身なし）。
    pub fn layout(&self) -> Vec<ChunkLayout> {
        self.lock().chunks.values().map(Chunk::layout).collect()
    }

    /// 全チャンクのメタデータと中身のコピー。
    pub fn snapshot_chunks(&self) -> Vec<ChunkImage> {
        let inner = self.lock();
        inner
            .chunks
            .values()
            .map(|c| ChunkImage {
                layout: c.layout(),
                bytes: unsafe { std::slice::from_raw_parts(c.base.as_ptr(), c.size) }.to_vec(),
            })
            .collect()
    }

    /// 全チャンクをロックしたまま `f` に (アドレス, 中身) を渡す。
    ///
    /// 疑似 fork は子プロセスへの書き込みをこの中で行う。コピー中にヒープが変化しない。
    pub fn with_chunks<R>(&self, f: impl FnOnce(&[(ChunkLayout, &[u8])]) -> R) -> R {
        let inner = self.lock();
        let views: Vec<(ChunkLayout, &[u8])> = inner
            .chunks
            .values()
            .map(|c| {
                (c.layout(), unsafe {
                    std::slice::from_raw_parts(c.base.as_ptr(), c.size)
                })
            })
            .collect();
        f(&views)
    }

    /// スナップショットを同じアドレスにマップし直して取り込む。
    ///
    /// どれか 1 つでもアドレスが使えなければ、それまでにマップした分を戻して
    /// [`Error::AddressUnavailable`] で失敗する（別アドレスへの再配置はしない）。
    pub fn restore(&self, images: &[ChunkImage]) -> Result<()> {
        let mut mapped: Vec<(NonNull<u8>, usize)> = Vec::new();
        let mut chunks = Vec::new();
        for image in images {
            let layout = &image.layout;
            if image.bytes.len() != layout.size {
                rollback(&mapped);
                return Err(Error::internal(format!(
                    "chunk image {:#x}: {} bytes for a {}-byte chunk",
                    layout.addr,
                    image.bytes.len(),
                    layout.size
                )));
            }
            let ptr = match native::map_region_at(layout.addr, layout.size) {
                Ok(p) => p,
                Err(e) => {
                    debug!(addr = layout.addr, size = layout.size, errno = %e, "restore address unavailable");
                    rollback(&mapped);
                    return Err(Error::AddressUnavailable {
                        addr: layout.addr,
                        size: layout.size,
                    });
                }
            };
            mapped.push((ptr, layout.size));
            unsafe {
                std::ptr::copy_nonoverlapping(image.bytes.as_ptr(), ptr.as_ptr(), layout.size)
            };
            match Chunk::from_layout(ptr, layout) {
                Ok(c) => chunks.push(c),
                Err(e) => {
                    rollback(&mapped);
                    return Err(e);
                }
            }
        }
        let mut inner = self.lock();
        for c in chunks {
            inner.chunks.insert(c.addr(), c);
        }
        debug!(chunks = images.len(), "heap restored from snapshot");
        Ok(())
    }

    /// すでにこのプロセスの同じアドレスに書き込まれているチャンクを取り込む
    /// （疑似 fork の子側。親が `VirtualAllocEx` + `WriteProcessMemory` で用意した領域）。
    ///
    /// # Safety
    ///
    /// 各 `layout.addr` から `layout.size` バイトが読み書き可能にマップ済みで、
    /// 他の誰にも所有されていないこと。
    pub unsafe fn adopt_mapped(&self, layouts: &[ChunkLayout]) -> Result<()> {
        let mut inner = self.lock();
        for layout in layouts {
            let ptr = NonNull::new(layout.addr as *mut u8)
                .ok_or_else(|| Error::internal("null chunk address in handoff"))?;
            let chunk = Chunk::from_layout(ptr, layout)?;
            inner.chunks.insert(layout.addr, chunk);
        }
        debug!(chunks = layouts.len(), "heap chunks adopted");
        Ok(())
    }

    /// ブロックにバイト列をコピーして確保する。
    pub fn alloc_bytes(&self, bytes: &[u8]) -> Result<NonNull<u8>> {
        let ptr = self.alloc(bytes.len())?;
        unsafe { std::ptr::copy_nonoverlapping(bytes.as_ptr(), ptr.as_ptr(), bytes.len()) };
        Ok(ptr)
    }
}

fn rollback(mapped: &[(NonNull<u8>, usize)]) {
    for &(ptr, size) in mapped {
        unsafe { native::unmap_region(ptr, size) };
    }
}

impl Drop for Heap {
    fn drop(&mut self) {
        self.inner
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .unmap_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    #[test]
    fn alloc_is_aligned_and_writable() {
        let heap = Heap::new(DEFAULT_MIN_CHUNK);
        let a = heap.alloc(1).unwrap();
        let b = heap.alloc(100).unwrap();
        assert_eq!(a.as_ptr() as usize % ALIGN, 0);
        assert_eq!(b.as_ptr() as usize % ALIGN, 0);
        unsafe {
            std::ptr::write_bytes(b.as_ptr(), 0xab, 100);
            assert_eq!(*b.as_ptr().add(99), 0xab);
        }
        assert_eq!(heap.block_size(a).unwrap(), 16);
        assert_eq!(heap.block_size(b).unwrap(), 112);
        heap.check().unwrap();
    }

    #[test]
    fn free_coalesces_both_neighbors() {
        let heap = Heap::new(DEFAULT_MIN_CHUNK);
        let a = heap.alloc(64).unwrap();
        let b = heap.alloc(64).unwrap();
        let c = heap.alloc(64).unwrap();
        let _guard = heap.alloc(64).unwrap();
        heap.free(a).unwrap();
        heap.free(c).unwrap();
        heap.check().unwrap();
        heap.free(b).unwrap();
        heap.check().unwrap();
        // a, b, c が 1 ブロックに結合されていれば 192 バイトがそこに収まる。
        let d = heap.alloc(192).unwrap();
        assert_eq!(d, a);
    }

    #[test]
    fn freeing_everything_leaves_one_free_block_per_chunk() {
        let heap = Heap::new(DEFAULT_MIN_CHUNK);
        let ptrs: Vec<_> = (1..200).map(|i| heap.alloc(i * 7).unwrap()).collect();
        for p in ptrs.into_iter().rev() {
            heap.free(p).unwrap();
        }
        let stats = heap.stats();
        assert_eq!(stats.live_blocks, 0);
        assert_eq!(stats.free_bytes, stats.mapped_bytes);
        for layout in heap.layout() {
            assert_eq!(layout.blocks.len(), 1);
        }
    }

    #[test]
    fn large_request_gets_its_own_chunk() {
        let heap = Heap::new(DEFAULT_MIN_CHUNK);
        let big = heap.alloc(200_000).unwrap();
        let stats = heap.stats();
        assert_eq!(stats.chunks, 1);
        assert_eq!(stats.mapped_bytes, round_up(200_000, CHUNK_GRANULARITY).unwrap());
        heap.free(big).unwrap();
        assert_eq!(heap.trim(), stats.mapped_bytes);
        assert_eq!(heap.stats(), HeapStats::default());
    }

    #[test]
    fn huge_sizes_are_out_of_memory() {
        let heap = Heap::new(DEFAULT_MIN_CHUNK);
        for size in [usize::MAX, usize::MAX - ALIGN, usize::MAX - 100] {
            assert!(
                matches!(heap.alloc(size), Err(Error::OutOfMemory { .. })),
                "size {size}"
            );
        }
        assert_eq!(heap.stats().chunks, 0);
        let a = heap.alloc(8).unwrap();
        assert!(matches!(
            heap.realloc(a, usize::MAX),
            Err(Error::OutOfMemory { .. })
        ));
        assert_eq!(heap.block_size(a).unwrap(), 16);
        heap.free(a).unwrap();
    }

    #[test]
    fn double_free_is_internal_error() {
        let heap = Heap::new(DEFAULT_MIN_CHUNK);
        let a = heap.alloc(32).unwrap();
        let _b = heap.alloc(32).unwrap();
        heap.free(a).unwrap();
        assert!(matches!(heap.free(a), Err(Error::Internal(_))));
        let outside = NonNull::from(&mut 0u8);
        assert!(matches!(heap.free(outside), Err(Error::Internal(_))));
    }

    #[test]
    fn realloc_keeps_contents() {
        let heap = Heap::new(DEFAULT_MIN_CHUNK);
        let a = heap.alloc_bytes(b"hello heap").unwrap();
        let blocker = heap.alloc(16).unwrap();
        let b = heap.realloc(a, 4096).unwrap();
        assert_ne!(a, b);
        let s = unsafe { std::slice::from_raw_parts(b.as_ptr(), 10) };
        assert_eq!(s, b"hello heap");
        heap.free(blocker).unwrap();

        let c = heap.realloc(b, 8192).unwrap();
        assert_eq!(c, b, "grows into the following free block");
        let d = heap.realloc(c, 32).unwrap();
        assert_eq!(d, c);
        assert_eq!(heap.block_size(d).unwrap(), 32);
        heap.check().unwrap();
    }

    fn snapshot_then_drop() -> (Vec<ChunkImage>, usize) {
        let parent = Heap::new(DEFAULT_MIN_CHUNK);
        let p = parent.alloc_bytes(b"pointer-laden").unwrap();
        // ブロック自身のアドレスを中に書いておき、子でも同じ値が読めることを見る。
        let q = parent.alloc(16).unwrap();
        unsafe { (q.as_ptr() as *mut usize).write(p.as_ptr() as usize) };
        (parent.snapshot_chunks(), q.as_ptr() as usize)
        // parent の drop でチャンクはアンマップされ、同じアドレスが空く。
    }

    #[test]
    fn snapshot_restores_at_identical_addresses() {
        // 並行するテストスレッドが空いた範囲を先に取ることがあるので数回試す。
        for _ in 0..5 {
            let (images, addr) = snapshot_then_drop();
            let child = Heap::new(DEFAULT_MIN_CHUNK);
            match child.restore(&images) {
                Err(Error::AddressUnavailable { .. }) => continue,
                other => other.unwrap(),
            }
            child.check().unwrap();
            let target = unsafe { (addr as *const usize).read() };
            let s = unsafe { std::slice::from_raw_parts(target as *const u8, 13) };
            assert_eq!(s, b"pointer-laden");
            let layouts: Vec<_> = images.iter().map(|i| i.layout.clone()).collect();
            assert_eq!(child.layout(), layouts);
            return;
        }
        panic!("address range never became available");
    }

    #[test]
    fn restore_fails_fast_when_address_taken() {
        let heap = Heap::new(DEFAULT_MIN_CHUNK);
        let _p = heap.alloc(16).unwrap();
        let images = heap.snapshot_chunks();
        let other = Heap::new(DEFAULT_MIN_CHUNK);
        // 元のヒープがまだ同じアドレスを使っている。
        let err = other.restore(&images).unwrap_err();
        assert!(matches!(err, Error::AddressUnavailable { addr, .. } if addr == images[0].layout.addr));
        assert_eq!(other.stats(), HeapStats::default());
    }

    proptest! {
        #[test]
        fn random_alloc_free_stays_consistent(
            ops in proptest::collection::vec((any::<bool>(), 1usize..3000, any::<usize>()), 1..200)
        ) {
            let heap = Heap::new(DEFAULT_MIN_CHUNK);
            let mut live: Vec<NonNull<u8>> = Vec::new();
            for (is_alloc, size, pick) in ops {
                if is_alloc || live.is_empty() {
                    live.push(heap.alloc(size).unwrap());
                } else {
                    let p = live.swap_remove(pick % live.len());
                    heap.free(p).unwrap();
                }
                prop_assert!(heap.check().is_ok());
                let stats = heap.stats();
                prop_assert!(stats.free_bytes <= stats.mapped_bytes);
                prop_assert_eq!(stats.live_blocks, live.len());
            }
            for p in live.drain(..) {
                heap.free(p).unwrap();
            }
            for layout in heap.layout() {
                prop_assert_eq!(layout.blocks.len(), 1);
                prop_assert!(layout.blocks[0].free);
            }
        }
    }
}
