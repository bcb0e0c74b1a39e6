//! Protocol 2 pickle streams laid out like the legacy SMPL assets:
//! chumpy wrapped arrays, a scipy csc regressor and a uint32 kintree table
#![allow(dead_code)]

use ndarray as nd;
use std::path::PathBuf;

pub const ROOT_U32: u32 = u32::MAX;

/// Emits opcodes into a buffer, one call per pickled object
pub struct PickleWriter {
    buf: Vec<u8>,
}

impl PickleWriter {
    pub fn new() -> Self {
        Self { buf: vec![0x80, 0x02] }
    }

    pub fn raw(&mut self, bytes: &[u8]) -> &mut Self {
        self.buf.extend_from_slice(bytes);
        self
    }

    pub fn int(&mut self, value: i32) -> &mut Self {
        self.raw(b"J").raw(&value.to_le_bytes())
    }

    pub fn text(&mut self, text: &str) -> &mut Self {
        let len = u32::try_from(text.len()).unwrap();
        self.raw(b"X").raw(&len.to_le_bytes()).raw(text.as_bytes())
    }

    /// A python 2 ``str``
    pub fn bytes(&mut self, bytes: &[u8]) -> &mut Self {
        let len = i32::try_from(bytes.len()).unwrap();
        self.raw(b"T").raw(&len.to_le_bytes()).raw(bytes)
    }

    pub fn global(&mut self, module: &str, name: &str) -> &mut Self {
        self.raw(b"c").raw(module.as_bytes()).raw(b"\n").raw(name.as_bytes()).raw(b"\n")
    }

    pub fn int_tuple(&mut self, values: &[usize]) -> &mut Self {
        self.raw(b"(");
        for v in values {
            self.int(i32::try_from(*v).unwrap());
        }
        self.raw(b"t")
    }

    fn dtype(&mut self, descr: &str) -> &mut Self {
        self.global("numpy", "dtype")
            .bytes(descr.as_bytes())
            .raw(b"K\x00K\x01\x87R(K\x03")
            .bytes(b"<")
            .raw(b"NNNJ\xff\xff\xff\xffJ\xff\xff\xff\xffK\x00tb")
    }

    /// ``numpy.core.multiarray._reconstruct`` followed by ``__setstate__``
    pub fn ndarray(&mut self, descr: &str, shape: &[usize], raw: &[u8]) -> &mut Self {
        self.global("numpy.core.multiarray", "_reconstruct")
            .global("numpy", "ndarray")
            .raw(b"K\x00\x85")
            .bytes(b"b")
            .raw(b"\x87R(K\x01")
            .int_tuple(shape)
            .dtype(descr)
            .raw(b"\x89")
            .bytes(raw)
            .raw(b"tb")
    }

    pub fn f64_array<D: nd::Dimension>(&mut self, array: &nd::Array<f64, D>) -> &mut Self {
        let raw: Vec<u8> = array.iter().flat_map(|v| v.to_le_bytes()).collect();
        self.ndarray("f8", array.shape(), &raw)
    }

    pub fn i32_array<D: nd::Dimension>(&mut self, array: &nd::Array<i32, D>) -> &mut Self {
        let raw: Vec<u8> = array.iter().flat_map(|v| v.to_le_bytes()).collect();
        self.ndarray("i4", array.shape(), &raw)
    }

    pub fn u32_array<D: nd::Dimension>(&mut self, array: &nd::Array<u32, D>) -> &mut Self {
        let raw: Vec<u8> = array.iter().flat_map(|v| v.to_le_bytes()).collect();
        self.ndarray("u4", array.shape(), &raw)
    }

    /// ``chumpy.ch.Ch`` instance whose ``attr`` holds whatever ``inner`` writes
    pub fn chumpy(&mut self, attr: &str, inner: impl FnOnce(&mut Self)) -> &mut Self {
        self.global("chumpy.ch", "Ch").raw(b")\x81}(").text(attr);
        inner(self);
        self.raw(b"ub")
    }

    /// ``scipy.sparse.csc.csc_matrix`` holding ``dense``
    pub fn csc(&mut self, dense: &nd::Array2<f64>) -> &mut Self {
        let mut data = Vec::new();
        let mut indices = Vec::new();
        let mut indptr = vec![0i32];
        for col in dense.columns() {
            for (row, v) in col.iter().enumerate() {
                if *v != 0.0 {
                    data.push(*v);
                    indices.push(i32::try_from(row).unwrap());
                }
            }
            indptr.push(i32::try_from(data.len()).unwrap());
        }
        self.global("scipy.sparse.csc", "csc_matrix").raw(b")\x81}(");
        self.text("_shape").int_tuple(&[dense.nrows(), dense.ncols()]);
        self.text("data").f64_array(&nd::Array1::from(data));
        self.text("indices").i32_array(&nd::Array1::from(indices));
        self.text("indptr").i32_array(&nd::Array1::from(indptr));
        self.text("maxprint").raw(b"K\x32");
        self.text("format").bytes(b"csc");
        self.raw(b"ub")
    }

    pub fn finish(&mut self) -> Vec<u8> {
        self.raw(b".");
        std::mem::take(&mut self.buf)
    }
}

/// The arrays of a legacy asset before pickling
#[derive(Clone)]
pub struct LegacyModel {
    pub v_template: nd::Array2<f64>,
    pub faces: nd::Array2<u32>,
    pub shapedirs: nd::Array3<f64>,
    pub posedirs: Option<nd::Array3<f64>>,
    pub j_regressor: nd::Array2<f64>,
    pub weights: nd::Array2<f64>,
    /// row 0 parents, ``u32::MAX`` for the root
    pub kintree_table: nd::Array2<u32>,
    pub sparse_regressor: bool,
    pub omit: Option<&'static str>,
}

impl LegacyModel {
    /// Four vertices, two faces, two betas and a two joint chain
    pub fn small() -> Self {
        let v_template = nd::array![[0.0, 0.0, 0.0], [1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.1, 0.2, 0.3]];
        let shapedirs = nd::Array3::from_shape_fn((4, 3, 2), |(v, c, b)| 0.01 * (v * 6 + c * 2 + b) as f64);
        Self {
            v_template,
            faces: nd::array![[0, 1, 2], [0, 2, 3]],
            shapedirs,
            posedirs: Some(nd::Array3::from_elem((4, 3, 9), 0.125)),
            j_regressor: nd::array![[0.25, 0.25, 0.25, 0.25], [0.0, 0.0, 0.5, 0.5]],
            weights: nd::array![[1.0, 0.0], [0.5, 0.5], [0.0, 1.0], [0.25, 0.75]],
            kintree_table: nd::array![[ROOT_U32, 0], [0, 1]],
            sparse_regressor: true,
            omit: None,
        }
    }

    /// SMPL sized: 6890 vertices, 10 zero shape components, 24 joints in the
    /// SMPL tree, no pose basis
    pub fn smpl_sized() -> Self {
        let num_verts = 6890;
        let num_joints = 24;
        let v_template = nd::Array2::from_shape_fn((num_verts, 3), |(v, c)| ((v * 3 + c) as f64).sin() * 0.731);
        let faces = nd::Array2::from_shape_fn((13776, 3), |(f, c)| u32::try_from((f + c * 17) % num_verts).unwrap());
        // each joint averages a block of consecutive vertices
        let block = num_verts / num_joints;
        let j_regressor = nd::Array2::from_shape_fn((num_joints, num_verts), |(j, v)| if v / block == j { 1.0 / block as f64 } else { 0.0 });
        let weights = nd::Array2::from_shape_fn((num_verts, num_joints), |(v, j)| if (v / block).min(num_joints - 1) == j { 1.0 } else { 0.0 });
        let parents: [i32; 24] = [-1, 0, 0, 0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 9, 9, 12, 13, 14, 16, 17, 18, 19, 20, 21];
        let kintree_table = nd::Array2::from_shape_fn((2, num_joints), |(row, j)| {
            if row == 1 {
                u32::try_from(j).unwrap()
            } else {
                u32::try_from(parents[j]).unwrap_or(ROOT_U32)
            }
        });
        Self {
            v_template,
            faces,
            shapedirs: nd::Array3::zeros((num_verts, 3, 10)),
            posedirs: None,
            j_regressor,
            weights,
            kintree_table,
            sparse_regressor: true,
            omit: None,
        }
    }

    pub fn to_pickle(&self) -> Vec<u8> {
        let mut w = PickleWriter::new();
        w.raw(b"}(");
        let entry = |w: &mut PickleWriter, key: &'static str, value: &dyn Fn(&mut PickleWriter)| {
            if self.omit != Some(key) {
                w.bytes(key.as_bytes());
                value(w);
            }
        };
        entry(&mut w, "v_template", &|w: &mut PickleWriter| {
            w.chumpy("x", |w| {
                w.f64_array(&self.v_template);
            });
        });
        entry(&mut w, "f", &|w: &mut PickleWriter| {
            w.u32_array(&self.faces);
        });
        entry(&mut w, "shapedirs", &|w: &mut PickleWriter| {
            w.chumpy("r", |w| {
                w.f64_array(&self.shapedirs);
            });
        });
        if let Some(posedirs) = &self.posedirs {
            entry(&mut w, "posedirs", &|w: &mut PickleWriter| {
                w.f64_array(posedirs);
            });
        }
        entry(&mut w, "J_regressor", &|w: &mut PickleWriter| {
            if self.sparse_regressor {
                w.csc(&self.j_regressor);
            } else {
                w.f64_array(&self.j_regressor);
            }
        });
        entry(&mut w, "weights", &|w: &mut PickleWriter| {
            w.chumpy("x", |w| {
                w.f64_array(&self.weights);
            });
        });
        entry(&mut w, "kintree_table", &|w: &mut PickleWriter| {
            w.u32_array(&self.kintree_table);
        });
        entry(&mut w, "bs_style", &|w: &mut PickleWriter| {
            w.bytes(b"lbs");
        });
        w.raw(b"u");
        w.finish()
    }
}

/// A fresh, empty directory under the system temp dir
pub fn scratch_dir(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("smpl_interchange_{}_{name}", std::process::id()));
    let _ = std::fs::remove_dir_all(&dir);
    std::fs::create_dir_all(&dir).unwrap();
    dir
}
