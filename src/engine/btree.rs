//! B+Tree 索引：id -> 文件偏移
//!
//! 节点保存在 arena（`Vec<Node>`）里，相互之间只用下标引用，
//! 叶子通过 `next` 下标串成链表，没有父指针也没有循环所有权。
//! 删除只做叶子内的逻辑移除，不合并欠载节点，空间由压缩兜底。

use anyhow::Result;

use crate::common::error_enum::StoreError;

#[derive(Debug)]
struct Node {
    leaf: bool,
    keys: Vec<i32>,
    /// 仅叶子使用
    offsets: Vec<u64>,
    /// 仅内部节点使用
    children: Vec<usize>,
    /// 叶子链表的下一个叶子
    next: Option<usize>,
}

impl Node {
    fn new_leaf() -> Self {
        Node {
            leaf: true,
            keys: Vec::new(),
            offsets: Vec::new(),
            children: Vec::new(),
            next: None,
        }
    }

    fn new_internal() -> Self {
        Node {
            leaf: false,
            keys: Vec::new(),
            offsets: Vec::new(),
            children: Vec::new(),
            next: None,
        }
    }
}

#[derive(Debug)]
pub struct BPlusTree {
    order: usize,
    root: usize,
    nodes: Vec<Node>,
    entries: usize,
}

impl BPlusTree {
    /// order 最小为 2；节点最多持有 order-1 个 key
    pub fn new(order: usize) -> Self {
        assert!(order >= 2, "order must be at least 2");
        BPlusTree {
            order,
            root: 0,
            nodes: vec![Node::new_leaf()],
            entries: 0,
        }
    }

    fn max_keys(&self) -> usize {
        self.order - 1
    }

    /// 下降方向：key >= 提升键的走右子树
    fn child_pos(node: &Node, id: i32) -> usize {
        node.keys.partition_point(|&k| id >= k)
    }

    /// 从根下降到可能包含 id 的叶子，返回路径上的 (节点, 子位置)
    fn descend(&self, id: i32) -> (usize, Vec<(usize, usize)>) {
        let mut path = Vec::new();
        let mut idx = self.root;
        while !self.nodes[idx].leaf {
            let pos = Self::child_pos(&self.nodes[idx], id);
            path.push((idx, pos));
            idx = self.nodes[idx].children[pos];
        }
        (idx, path)
    }

    /// 插入或覆盖；非正数 id 直接拒绝
    pub fn insert(&mut self, id: i32, offset: u64) -> Result<()> {
        if id <= 0 {
            return Err(anyhow::Error::from(StoreError::Validation(format!(
                "index key must be positive, got {}",
                id
            ))));
        }
        let (leaf_idx, path) = self.descend(id);
        let leaf = &mut self.nodes[leaf_idx];
        match leaf.keys.binary_search(&id) {
            Ok(pos) => {
                leaf.offsets[pos] = offset;
                return Ok(());
            }
            Err(pos) => {
                leaf.keys.insert(pos, id);
                leaf.offsets.insert(pos, offset);
                self.entries += 1;
            }
        }
        self.propagate_splits(leaf_idx, path);
        Ok(())
    }

    /// 自底向上分裂溢出节点，必要时长出新根
    fn propagate_splits(&mut self, start: usize, mut path: Vec<(usize, usize)>) {
        let mut idx = start;
        while self.nodes[idx].keys.len() > self.max_keys() {
            let (promoted, right_idx) = self.split(idx);
            match path.pop() {
                Some((parent, pos)) => {
                    self.nodes[parent].keys.insert(pos, promoted);
                    self.nodes[parent].children.insert(pos + 1, right_idx);
                    idx = parent;
                }
                None => {
                    let mut new_root = Node::new_internal();
                    new_root.keys.push(promoted);
                    new_root.children.push(idx);
                    new_root.children.push(right_idx);
                    self.nodes.push(new_root);
                    self.root = self.nodes.len() - 1;
                    break;
                }
            }
        }
    }

    /// 分裂一个溢出节点，返回 (提升键, 右节点下标)
    ///
    /// 叶子分裂提升右半首键并保留它；内部节点分裂把中间键上移
    fn split(&mut self, idx: usize) -> (i32, usize) {
        let right_idx = self.nodes.len();
        let node = &mut self.nodes[idx];
        let mid = node.keys.len() / 2;
        let (promoted, right) = if node.leaf {
            let mut right = Node::new_leaf();
            right.keys = node.keys.split_off(mid);
            right.offsets = node.offsets.split_off(mid);
            right.next = node.next;
            node.next = Some(right_idx);
            (right.keys[0], right)
        } else {
            let mut right = Node::new_internal();
            right.keys = node.keys.split_off(mid + 1);
            right.children = node.children.split_off(mid + 1);
            let promoted = node.keys.pop().expect("internal split on empty node");
            (promoted, right)
        };
        self.nodes.push(right);
        (promoted, right_idx)
    }

    /// 点查；不存在返回 None，从不报错
    pub fn lookup(&self, id: i32) -> Option<u64> {
        if id <= 0 {
            return None;
        }
        let (leaf_idx, _) = self.descend(id);
        let leaf = &self.nodes[leaf_idx];
        leaf.keys
            .binary_search(&id)
            .ok()
            .map(|pos| leaf.offsets[pos])
    }

    pub fn contains(&self, id: i32) -> bool {
        self.lookup(id).is_some()
    }

    /// 把 id 的偏移从 old 改写为 new；幂等
    pub fn update_offset(&mut self, id: i32, old: u64, new: u64) -> bool {
        let (leaf_idx, _) = self.descend(id);
        let leaf = &mut self.nodes[leaf_idx];
        if let Ok(pos) = leaf.keys.binary_search(&id) {
            if leaf.offsets[pos] == old {
                leaf.offsets[pos] = new;
                return true;
            }
            // 已经指向 new 的重复调用视为成功
            return leaf.offsets[pos] == new;
        }
        false
    }

    /// 逻辑删除叶子条目；不做旁系合并
    pub fn delete(&mut self, id: i32) -> bool {
        let (leaf_idx, _) = self.descend(id);
        let leaf = &mut self.nodes[leaf_idx];
        match leaf.keys.binary_search(&id) {
            Ok(pos) => {
                leaf.keys.remove(pos);
                leaf.offsets.remove(pos);
                self.entries -= 1;
                true
            }
            Err(_) => false,
        }
    }

    fn leftmost_leaf(&self) -> usize {
        let mut idx = self.root;
        while !self.nodes[idx].leaf {
            idx = self.nodes[idx].children[0];
        }
        idx
    }

    /// 升序枚举全部 id（沿叶子链表走一遍）
    pub fn all_ids(&self) -> Vec<i32> {
        let mut out = Vec::with_capacity(self.entries);
        let mut cur = Some(self.leftmost_leaf());
        while let Some(idx) = cur {
            let leaf = &self.nodes[idx];
            out.extend_from_slice(&leaf.keys);
            cur = leaf.next;
        }
        out
    }

    /// 范围查询 [lo, hi]，返回命中的偏移
    pub fn range(&self, lo: i32, hi: i32) -> Vec<u64> {
        let mut out = Vec::new();
        if lo > hi {
            return out;
        }
        let (mut idx, _) = {
            let (leaf, path) = self.descend(lo);
            (Some(leaf), path)
        };
        while let Some(i) = idx {
            let leaf = &self.nodes[i];
            for (pos, &k) in leaf.keys.iter().enumerate() {
                if k > hi {
                    return out;
                }
                if k >= lo {
                    out.push(leaf.offsets[pos]);
                }
            }
            idx = leaf.next;
        }
        out
    }

    pub fn len(&self) -> usize {
        self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries == 0
    }
}

#[cfg(test)]
mod test {
    use super::*;

    // 固定种子的伪随机序列，避免引入随机数依赖
    fn shuffled(n: i32) -> Vec<i32> {
        let mut ids: Vec<i32> = (1..=n).collect();
        let mut state = 0x2545_f491_u64;
        for i in (1..ids.len()).rev() {
            state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            let j = (state >> 33) as usize % (i + 1);
            ids.swap(i, j);
        }
        ids
    }

    #[test]
    fn insert_lookup_test() -> Result<()> {
        let mut tree = BPlusTree::new(4);
        for &id in shuffled(500).iter() {
            tree.insert(id, id as u64 * 10)?;
        }
        assert_eq!(tree.len(), 500);
        for id in 1..=500 {
            assert_eq!(tree.lookup(id), Some(id as u64 * 10), "id {}", id);
        }
        assert_eq!(tree.lookup(501), None);
        Ok(())
    }

    #[test]
    fn all_ids_sorted_test() -> Result<()> {
        let mut tree = BPlusTree::new(3);
        for &id in shuffled(200).iter() {
            tree.insert(id, id as u64)?;
        }
        let ids = tree.all_ids();
        let expected: Vec<i32> = (1..=200).collect();
        assert_eq!(ids, expected);
        Ok(())
    }

    #[test]
    fn reject_non_positive_test() {
        let mut tree = BPlusTree::new(4);
        assert!(tree.insert(0, 1).is_err());
        assert!(tree.insert(-5, 1).is_err());
        assert_eq!(tree.lookup(-5), None);
    }

    #[test]
    fn overwrite_existing_test() -> Result<()> {
        let mut tree = BPlusTree::new(4);
        tree.insert(1, 100)?;
        tree.insert(1, 200)?;
        assert_eq!(tree.len(), 1);
        assert_eq!(tree.lookup(1), Some(200));
        Ok(())
    }

    #[test]
    fn delete_test() -> Result<()> {
        let mut tree = BPlusTree::new(4);
        for &id in shuffled(100).iter() {
            tree.insert(id, id as u64)?;
        }
        for id in (1..=100).step_by(2) {
            assert!(tree.delete(id));
        }
        assert!(!tree.delete(1));
        assert_eq!(tree.len(), 50);
        for id in 1..=100 {
            if id % 2 == 0 {
                assert_eq!(tree.lookup(id), Some(id as u64));
            } else {
                assert_eq!(tree.lookup(id), None);
            }
        }
        Ok(())
    }

    #[test]
    fn update_offset_idempotent_test() -> Result<()> {
        let mut tree = BPlusTree::new(4);
        tree.insert(42, 1000)?;
        assert!(tree.update_offset(42, 1000, 2000));
        // 相同参数的第二次调用结果不变
        assert!(tree.update_offset(42, 1000, 2000));
        assert_eq!(tree.lookup(42), Some(2000));
        // 过期的 old 偏移不匹配
        assert!(!tree.update_offset(42, 1234, 3000));
        assert_eq!(tree.lookup(42), Some(2000));
        Ok(())
    }

    #[test]
    fn range_test() -> Result<()> {
        let mut tree = BPlusTree::new(3);
        for &id in shuffled(60).iter() {
            tree.insert(id, id as u64 * 2)?;
        }
        let hits = tree.range(10, 20);
        let expected: Vec<u64> = (10..=20).map(|i| i as u64 * 2).collect();
        assert_eq!(hits, expected);
        assert!(tree.range(61, 100).is_empty());
        assert!(tree.range(20, 10).is_empty());
        Ok(())
    }

    #[test]
    fn minimal_order_test() -> Result<()> {
        let mut tree = BPlusTree::new(2);
        for &id in shuffled(64).iter() {
            tree.insert(id, id as u64)?;
        }
        for id in 1..=64 {
            assert_eq!(tree.lookup(id), Some(id as u64));
        }
        Ok(())
    }
}
