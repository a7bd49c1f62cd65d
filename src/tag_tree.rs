//! The tag tree, described in Section B.10.2.
//!
//! Tag trees are quad trees where each leaf stores an integer value. Each
//! intermediate node stores the smallest value of all of its children: if a
//! node stores the value 3, all of its children have a value of 3 or higher.
//! The root therefore stores the smallest value across the whole tree.
//!
//! Two independent walks are supported: [`TagTree::read`] (threshold-walk
//! decode, B.10.2) and [`TagTree::write`] (the same walk in the opposite
//! direction, emitting the bits a decoder would consume).

use crate::bit_reader::BitReader;
use crate::bit_writer::BitWriter;

#[cfg(feature = "logging")]
use log::warn;

#[derive(Debug, PartialEq, Eq, Clone, Default)]
pub(crate) struct TagNode {
    /// Width of the area covered by the node. Zero for a dummy node that
    /// doesn't actually exist but was pushed to keep the children array
    /// uniform.
    width: u32,
    height: u32,
    /// The node's current value. Only meaningful once `initialized`.
    value: u32,
    /// Whether the node's value has been fixed. A tag tree isn't stored in
    /// one piece; each call to `read`/`write` contributes to it, so a node
    /// is finalized the first time the threshold walk passes over it.
    initialized: bool,
    /// Zero for leaf nodes, greater for interior nodes. The root has the
    /// highest level.
    level: u16,
    /// Child indices into the tree's shared node arena; `usize::MAX` marks
    /// a non-existent child.
    children: [usize; 4],
}

impl TagNode {
    fn new(width: u32, height: u32, level: u16) -> Self {
        Self {
            width,
            height,
            level,
            value: 0,
            initialized: false,
            children: [usize::MAX, usize::MAX, usize::MAX, usize::MAX],
        }
    }

    fn top_left_width(&self) -> u32 {
        u32::min(1 << (self.level - 1), self.width)
    }

    fn top_left_height(&self) -> u32 {
        u32::min(1 << (self.level - 1), self.height)
    }
}

impl TagNode {
    fn build(width: u32, height: u32, level: u16, nodes: &mut Vec<TagNode>) -> Self {
        let mut tag = TagNode::new(width, height, level);

        if level == 0 {
            assert!(width <= 1 && height <= 1);
            return tag;
        }

        let top_left_width = tag.top_left_width();
        let top_left_height = tag.top_left_height();

        let mut push = |node: TagNode, child_idx: usize, nodes: &mut Vec<TagNode>| {
            if node.width > 0 && node.height > 0 {
                let node_idx = nodes.len();
                nodes.push(node);
                tag.children[child_idx] = node_idx;
            }
        };

        let n1 = TagNode::build(top_left_width, top_left_height, level - 1, nodes);
        push(n1, 0, nodes);

        let n2 = TagNode::build(width - top_left_width, top_left_height, level - 1, nodes);
        push(n2, 1, nodes);

        let n3 = TagNode::build(top_left_width, height - top_left_height, level - 1, nodes);
        push(n3, 2, nodes);

        let n4 = TagNode::build(
            width - top_left_width,
            height - top_left_height,
            level - 1,
            nodes,
        );
        push(n4, 3, nodes);

        tag
    }
}

fn read_tag_node(
    node_idx: usize,
    x: u32,
    y: u32,
    reader: &mut BitReader,
    parent_val: u32,
    max_val: u32,
    nodes: &mut [TagNode],
) -> Option<u32> {
    let node = &mut nodes[node_idx];

    if !node.initialized {
        let mut val = u32::max(parent_val, node.value);

        loop {
            if val >= max_val {
                break;
            }

            // A 0 bit means the minimum is larger than the current value; a
            // 1 bit means the minimum (or the value, at the top level) has
            // been reached.
            match reader.read_bits_with_stuffing(1)? {
                0 => val += 1,
                1 => {
                    node.initialized = true;
                    break;
                }
                _ => unreachable!(),
            }
        }

        node.value = val;
    }

    if node.value >= max_val || node.level == 0 {
        return Some(node.value);
    }

    let top_left_width = node.top_left_width();
    let top_left_height = node.top_left_height();

    let left = x < top_left_width;
    let top = y < top_left_height;

    match (left, top) {
        (true, true) => read_tag_node(node.children[0], x, y, reader, node.value, max_val, nodes),
        (false, true) => read_tag_node(
            node.children[1],
            x - top_left_width,
            y,
            reader,
            node.value,
            max_val,
            nodes,
        ),
        (true, false) => read_tag_node(
            node.children[2],
            x,
            y - top_left_height,
            reader,
            node.value,
            max_val,
            nodes,
        ),
        (false, false) => read_tag_node(
            node.children[3],
            x - top_left_width,
            y - top_left_height,
            reader,
            node.value,
            max_val,
            nodes,
        ),
    }
}

/// Mirror of [`read_tag_node`]: walks the same quadtree but emits bits for a
/// node value that is already known (computed up front from the full code
/// block population, e.g. the inclusion layer or the zero-bit-plane count)
/// instead of reading them back.
fn write_tag_node(
    node_idx: usize,
    x: u32,
    y: u32,
    writer: &mut BitWriter,
    parent_val: u32,
    max_val: u32,
    target: u32,
    nodes: &mut [TagNode],
) {
    let node = &mut nodes[node_idx];

    if !node.initialized {
        let start = u32::max(parent_val, node.value);
        let effective = u32::min(target, max_val);

        let mut val = start;
        while val < effective {
            writer.write_bits_with_stuffing(0, 1);
            val += 1;
        }

        if val < max_val {
            writer.write_bits_with_stuffing(1, 1);
            node.initialized = true;
        }

        node.value = val;
    }

    if node.value >= max_val || node.level == 0 {
        return;
    }

    let top_left_width = node.top_left_width();
    let top_left_height = node.top_left_height();

    let left = x < top_left_width;
    let top = y < top_left_height;

    match (left, top) {
        (true, true) => write_tag_node(
            node.children[0],
            x,
            y,
            writer,
            node.value,
            max_val,
            target,
            nodes,
        ),
        (false, true) => write_tag_node(
            node.children[1],
            x - top_left_width,
            y,
            writer,
            node.value,
            max_val,
            target,
            nodes,
        ),
        (true, false) => write_tag_node(
            node.children[2],
            x,
            y - top_left_height,
            writer,
            node.value,
            max_val,
            target,
            nodes,
        ),
        (false, false) => write_tag_node(
            node.children[3],
            x - top_left_width,
            y - top_left_height,
            writer,
            node.value,
            max_val,
            target,
            nodes,
        ),
    }
}

#[derive(Copy, Clone)]
pub(crate) struct TagTree {
    root: usize,
    width: u32,
    height: u32,
}

impl TagTree {
    pub(crate) fn new(width: u32, height: u32, nodes: &mut Vec<TagNode>) -> Self {
        let level = u32::max(
            width.next_power_of_two().ilog2(),
            height.next_power_of_two().ilog2(),
        );

        let node = TagNode::build(width, height, level as u16, nodes);
        let idx = nodes.len();
        nodes.push(node);

        Self {
            root: idx,
            width,
            height,
        }
    }

    pub(crate) fn read(
        &mut self,
        x: u32,
        y: u32,
        reader: &mut BitReader,
        max_val: u32,
        nodes: &mut [TagNode],
    ) -> Option<u32> {
        if x >= self.width || y >= self.height {
            #[cfg(feature = "logging")]
            warn!(
                "attempted to read invalid index x: {x}, y: {y} in tag tree with dimensions {}x{}",
                self.width, self.height
            );

            return None;
        }

        read_tag_node(self.root, x, y, reader, 0, max_val, nodes)
    }

    /// Encodes the value at `(x, y)` against a threshold, the encode-side
    /// counterpart of [`TagTree::read`]. `target` is the value to commit at
    /// this node (a layer index for an inclusion tree, a bit-plane count for
    /// a zero-bit-plane tree); `max_val` bounds the walk the same way it
    /// does on decode.
    pub(crate) fn write(
        &mut self,
        x: u32,
        y: u32,
        writer: &mut BitWriter,
        max_val: u32,
        target: u32,
        nodes: &mut [TagNode],
    ) {
        if x >= self.width || y >= self.height {
            #[cfg(feature = "logging")]
            warn!(
                "attempted to write invalid index x: {x}, y: {y} in tag tree with dimensions {}x{}",
                self.width, self.height
            );

            return;
        }

        write_tag_node(self.root, x, y, writer, 0, max_val, target, nodes);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    impl TagNode {
        fn real_children(&self) -> usize {
            self.children
                .iter()
                .map(|c| if *c != usize::MAX { 1 } else { 0 })
                .sum()
        }
    }

    fn bits_to_bytes(bits: &[u32]) -> Vec<u8> {
        let mut writer = BitWriter::new();
        for &b in bits {
            writer.write_bit_with_stuffing(b);
        }
        writer.finish()
    }

    /// The example from B.10.2, in its extended form as shown in the
    /// "JPEG2000 Standard for Image compression" book.
    #[test]
    fn tag_tree_1() {
        let mut nodes = vec![];
        let mut tree = TagTree::new(6, 3, &mut nodes);

        assert_eq!(nodes[tree.root].real_children(), 2);
        assert_eq!(nodes[nodes[tree.root].children[0]].real_children(), 4);
        assert_eq!(
            nodes[nodes[nodes[tree.root].children[0]].children[0]].real_children(),
            4
        );
        assert_eq!(
            nodes[nodes[nodes[tree.root].children[0]].children[1]].real_children(),
            4
        );
        assert_eq!(
            nodes[nodes[nodes[tree.root].children[0]].children[2]].real_children(),
            2
        );
        assert_eq!(
            nodes[nodes[nodes[tree.root].children[0]].children[3]].real_children(),
            2
        );
        assert_eq!(nodes[nodes[tree.root].children[1]].real_children(), 2);
        assert_eq!(
            nodes[nodes[nodes[tree.root].children[1]].children[0]].real_children(),
            4
        );
        assert_eq!(
            nodes[nodes[nodes[tree.root].children[1]].children[2]].real_children(),
            2
        );

        let buf = bits_to_bytes(&[
            0, 1, 1, 1, 1, // q3(0, 0)
            0, 0, 1, // q3(1, 0)
            1, 0, 1, // q3(2, 0)
            0, 0, 1, // q3(3, 0)
            1, 0, 1, 1, // q3(4, 0)
        ]);

        let mut reader = BitReader::new(&buf);

        assert_eq!(
            tree.read(0, 0, &mut reader, u32::MAX, &mut nodes).unwrap(),
            1
        );
        assert_eq!(
            tree.read(1, 0, &mut reader, u32::MAX, &mut nodes).unwrap(),
            3
        );
        assert_eq!(
            tree.read(2, 0, &mut reader, u32::MAX, &mut nodes).unwrap(),
            2
        );
        assert_eq!(
            tree.read(3, 0, &mut reader, u32::MAX, &mut nodes).unwrap(),
            3
        );
        assert_eq!(
            tree.read(4, 0, &mut reader, u32::MAX, &mut nodes).unwrap(),
            2
        );
    }

    /// Inclusion tag tree from Table B.5.
    #[test]
    fn tag_tree_2() {
        let mut nodes = vec![];
        let mut tree = TagTree::new(3, 2, &mut nodes);

        let buf = bits_to_bytes(&[
            1, 1, 1, // Code-block 0, 0 included for the first time.
            1, // Code-block 1, 0 included for the first time.
            0, // Code-block 2, 0 not yet included.
            0, // Code-block 0, 1 not yet included.
            0, // Code-block 1, 2 not yet included.
        ]);

        let mut reader = BitReader::new(&buf);
        let next_layer = 1;

        assert_eq!(
            tree.read(0, 0, &mut reader, next_layer, &mut nodes)
                .unwrap(),
            0
        );
        assert_eq!(
            tree.read(1, 0, &mut reader, next_layer, &mut nodes)
                .unwrap(),
            0
        );
        assert_eq!(
            tree.read(2, 0, &mut reader, next_layer, &mut nodes)
                .unwrap(),
            1
        );
        assert_eq!(
            tree.read(0, 1, &mut reader, next_layer, &mut nodes)
                .unwrap(),
            1
        );
        assert_eq!(
            tree.read(1, 1, &mut reader, next_layer, &mut nodes)
                .unwrap(),
            1
        );
        assert_eq!(
            tree.read(2, 1, &mut reader, next_layer, &mut nodes)
                .unwrap(),
            1
        );
    }

    /// Round-trips a handful of values through `write` then `read` and
    /// checks the decoded values match what was committed.
    #[test]
    fn write_read_round_trip() {
        let values = [[3u32, 1, 4], [1, 5, 9]];

        let mut write_nodes = vec![];
        let mut write_tree = TagTree::new(3, 2, &mut write_nodes);
        let mut writer = BitWriter::new();

        for y in 0..2u32 {
            for x in 0..3u32 {
                writer.write_bits_with_stuffing(0, 0); // no-op, keeps symmetry with read loop
                write_tree.write(
                    x,
                    y,
                    &mut writer,
                    u32::MAX,
                    values[y as usize][x as usize],
                    &mut write_nodes,
                );
            }
        }

        let buf = writer.finish();

        let mut read_nodes = vec![];
        let mut read_tree = TagTree::new(3, 2, &mut read_nodes);
        let mut reader = BitReader::new(&buf);

        for y in 0..2u32 {
            for x in 0..3u32 {
                let decoded = read_tree
                    .read(x, y, &mut reader, u32::MAX, &mut read_nodes)
                    .unwrap();
                assert_eq!(decoded, values[y as usize][x as usize]);
            }
        }
    }
}
