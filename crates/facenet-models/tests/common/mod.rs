//! Writes small HDF5 files laid out the way h5py stores Keras weights:
//! superblock v0, v1 object headers, symbol-table groups and contiguous
//! little-endian float32 datasets.
#![allow(dead_code)]

use candle_core::Tensor;
use facenet_models::hdf5::SIGNATURE;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;

const UNDEF: u64 = u64::MAX;
const SUPERBLOCK_LEN: usize = 96;
const SYMBOLS_PER_NODE: usize = 8;

pub enum Node {
    Group(Vec<(String, Node)>),
    Dataset { shape: Vec<usize>, values: Vec<f32> },
}

impl Node {
    pub fn group(members: Vec<(&str, Node)>) -> Self {
        Node::Group(
            members
                .into_iter()
                .map(|(name, node)| (name.to_string(), node))
                .collect(),
        )
    }

    pub fn dataset(shape: &[usize], values: Vec<f32>) -> Self {
        assert_eq!(shape.iter().product::<usize>(), values.len());
        Node::Dataset {
            shape: shape.to_vec(),
            values,
        }
    }
}

/// How groups and headers are encoded.
#[derive(Debug, Clone, Copy, Default)]
pub struct Style {
    /// Store group members as link messages instead of a symbol table.
    pub link_messages: bool,
    /// Move all but the first header message into a continuation block.
    pub continuation: bool,
}

struct Writer {
    buf: Vec<u8>,
    style: Style,
}

impl Writer {
    fn addr(&self) -> u64 {
        self.buf.len() as u64
    }

    fn put(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    fn pad8(&mut self) {
        while self.buf.len() % 8 != 0 {
            self.buf.push(0);
        }
    }

    fn node(&mut self, node: &Node) -> u64 {
        match node {
            Node::Group(members) => self.group(members),
            Node::Dataset { shape, values } => self.dataset(shape, values),
        }
    }

    fn object_header(&mut self, messages: &[(u16, Vec<u8>)]) -> u64 {
        let (head, tail) = if self.style.continuation && messages.len() > 1 {
            messages.split_at(1)
        } else {
            (messages, &[][..])
        };

        let mut count = messages.len();
        let mut block = encode_messages(head);
        if !tail.is_empty() {
            count += 1;
            self.pad8();
            let cont_addr = self.addr();
            let cont = encode_messages(tail);
            self.put(&cont);
            let mut body = cont_addr.to_le_bytes().to_vec();
            body.extend_from_slice(&(cont.len() as u64).to_le_bytes());
            block.extend(encode_messages(&[(0x0010, body)]));
        }

        self.pad8();
        let start = self.addr();
        self.put(&[1, 0]);
        self.put(&(count as u16).to_le_bytes());
        self.put(&1u32.to_le_bytes());
        self.put(&(block.len() as u32).to_le_bytes());
        self.put(&[0; 4]);
        self.put(&block);
        start
    }

    fn dataset(&mut self, shape: &[usize], values: &[f32]) -> u64 {
        self.pad8();
        let data = self.addr();
        for v in values {
            self.put(&v.to_le_bytes());
        }

        let mut dataspace = vec![1, shape.len() as u8, 0, 0, 0, 0, 0, 0];
        for &dim in shape {
            dataspace.extend_from_slice(&(dim as u64).to_le_bytes());
        }

        // IEEE little-endian float32
        let mut datatype = vec![0x11, 0x20, 0x1f, 0x00];
        datatype.extend_from_slice(&4u32.to_le_bytes());
        datatype.extend_from_slice(&0u16.to_le_bytes());
        datatype.extend_from_slice(&32u16.to_le_bytes());
        datatype.extend_from_slice(&[23, 8, 0, 23]);
        datatype.extend_from_slice(&127u32.to_le_bytes());

        let mut layout = vec![3, 1];
        layout.extend_from_slice(&data.to_le_bytes());
        layout.extend_from_slice(&((values.len() * 4) as u64).to_le_bytes());

        self.object_header(&[(0x0001, dataspace), (0x0003, datatype), (0x0008, layout)])
    }

    fn group(&mut self, members: &[(String, Node)]) -> u64 {
        let mut entries: Vec<(String, u64)> = members
            .iter()
            .map(|(name, node)| (name.clone(), self.node(node)))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));

        if self.style.link_messages {
            let links: Vec<(u16, Vec<u8>)> = entries
                .iter()
                .map(|(name, addr)| {
                    let mut body = vec![1, 0, name.len() as u8];
                    body.extend_from_slice(name.as_bytes());
                    body.extend_from_slice(&addr.to_le_bytes());
                    (0x0006, body)
                })
                .collect();
            return self.object_header(&links);
        }

        let mut heap = vec![0u8; 8];
        let mut offsets = Vec::new();
        for (name, _) in &entries {
            offsets.push(heap.len() as u64);
            heap.extend_from_slice(name.as_bytes());
            heap.push(0);
            while heap.len() % 8 != 0 {
                heap.push(0);
            }
        }
        self.pad8();
        let heap_data = self.addr();
        self.put(&heap);
        let heap_addr = self.addr();
        self.put(b"HEAP");
        self.put(&[0; 4]);
        self.put(&(heap.len() as u64).to_le_bytes());
        self.put(&UNDEF.to_le_bytes());
        self.put(&heap_data.to_le_bytes());

        let mut children = Vec::new();
        for (chunk_idx, chunk) in entries.chunks(SYMBOLS_PER_NODE).enumerate() {
            let node = self.addr();
            self.put(b"SNOD");
            self.put(&[1, 0]);
            self.put(&(chunk.len() as u16).to_le_bytes());
            for (i, (_, header)) in chunk.iter().enumerate() {
                self.put(&offsets[chunk_idx * SYMBOLS_PER_NODE + i].to_le_bytes());
                self.put(&header.to_le_bytes());
                self.put(&[0; 24]);
            }
            let last_key = offsets[chunk_idx * SYMBOLS_PER_NODE + chunk.len() - 1];
            children.push((node, last_key));
        }

        let btree = self.addr();
        self.put(b"TREE");
        self.put(&[0, 0]);
        self.put(&(children.len() as u16).to_le_bytes());
        self.put(&UNDEF.to_le_bytes());
        self.put(&UNDEF.to_le_bytes());
        self.put(&0u64.to_le_bytes());
        for (node, key) in children {
            self.put(&node.to_le_bytes());
            self.put(&key.to_le_bytes());
        }

        let mut symbol_table = btree.to_le_bytes().to_vec();
        symbol_table.extend_from_slice(&heap_addr.to_le_bytes());
        self.object_header(&[(0x0011, symbol_table)])
    }
}

fn encode_messages(messages: &[(u16, Vec<u8>)]) -> Vec<u8> {
    let mut out = Vec::new();
    for (kind, body) in messages {
        let padded = body.len().div_ceil(8) * 8;
        out.extend_from_slice(&kind.to_le_bytes());
        out.extend_from_slice(&(padded as u16).to_le_bytes());
        out.extend_from_slice(&[0; 4]);
        out.extend_from_slice(body);
        out.resize(out.len() + padded - body.len(), 0);
    }
    out
}

/// Encode `root` as an HDF5 file.
pub fn to_hdf5(root: &[(String, Node)], style: Style) -> Vec<u8> {
    let mut w = Writer {
        buf: vec![0; SUPERBLOCK_LEN],
        style,
    };
    let root_addr = w.group(root);
    let eof = w.addr();

    let mut sb = SIGNATURE.to_vec();
    // version 0, 8-byte offsets and lengths
    sb.extend_from_slice(&[0, 0, 0, 0, 0, 8, 8, 0]);
    sb.extend_from_slice(&4u16.to_le_bytes());
    sb.extend_from_slice(&16u16.to_le_bytes());
    sb.extend_from_slice(&0u32.to_le_bytes());
    sb.extend_from_slice(&0u64.to_le_bytes());
    sb.extend_from_slice(&UNDEF.to_le_bytes());
    sb.extend_from_slice(&eof.to_le_bytes());
    sb.extend_from_slice(&UNDEF.to_le_bytes());
    sb.extend_from_slice(&0u64.to_le_bytes());
    sb.extend_from_slice(&root_addr.to_le_bytes());
    sb.extend_from_slice(&[0; 24]);
    assert_eq!(sb.len(), SUPERBLOCK_LEN);
    w.buf[..SUPERBLOCK_LEN].copy_from_slice(&sb);
    w.buf
}

/// Arrange candle parameters (`<layer>.<param>`) as Keras stores them:
/// `<layer>/<layer>/<name>:0` with `HWIO` convolution and `(in, out)` dense
/// kernels.
pub fn keras_layout(tensors: &HashMap<String, Tensor>) -> Vec<(String, Node)> {
    let mut layers: BTreeMap<String, Vec<(String, Node)>> = BTreeMap::new();
    for (name, tensor) in tensors {
        let (layer, param) = name.rsplit_once('.').unwrap();
        let batch_norm = layer.starts_with("batch_normalization") || layer.ends_with("_bn");
        let key = match param {
            "weight" => "kernel:0",
            "bias" if batch_norm => "beta:0",
            "bias" => "bias:0",
            "running_mean" => "moving_mean:0",
            "running_var" => "moving_variance:0",
            other => panic!("unexpected parameter {}", other),
        };
        let value = match tensor.rank() {
            4 => tensor.permute((2, 3, 1, 0)).unwrap(),
            2 => tensor.t().unwrap(),
            _ => tensor.clone(),
        };
        let shape = value.dims().to_vec();
        let values = value
            .contiguous()
            .unwrap()
            .flatten_all()
            .unwrap()
            .to_vec1::<f32>()
            .unwrap();
        layers
            .entry(layer.to_string())
            .or_default()
            .push((key.to_string(), Node::Dataset { shape, values }));
    }
    layers
        .into_iter()
        .map(|(layer, datasets)| {
            let inner = vec![(layer.clone(), Node::Group(datasets))];
            (layer, Node::Group(inner))
        })
        .collect()
}

/// Write `tensors` to `path` as a Keras weights file.
pub fn write_keras_weights(path: &Path, tensors: &HashMap<String, Tensor>) {
    let bytes = to_hdf5(&keras_layout(tensors), Style::default());
    std::fs::write(path, bytes).unwrap();
}
