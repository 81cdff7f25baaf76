//! Hand-assembled pickles shaped like the output of numpy under Python 2.

use flate2::write::GzEncoder;
use flate2::Compression;
use once_cell::sync::Lazy;
use std::io::Write;

pub(crate) struct Pickler {
    buf: Vec<u8>,
    memo: u8,
    dtype: u8,
}

impl Pickler {
    pub fn new(proto: u8) -> Self {
        Self {
            buf: vec![0x80, proto],
            memo: 0,
            dtype: 0,
        }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn raw(&mut self, b: &[u8]) {
        self.buf.extend_from_slice(b);
    }

    pub fn mark(&mut self) {
        self.raw(b"(");
    }

    pub fn stop(&mut self) {
        self.raw(b".");
    }

    pub fn int(&mut self, v: i64) {
        match v {
            0..=0xff => self.raw(&[b'K', v as u8]),
            0x100..=0xffff => {
                self.raw(b"M");
                self.raw(&(v as u16).to_le_bytes());
            }
            _ if i32::try_from(v).is_ok() => {
                self.raw(b"J");
                self.raw(&(v as i32).to_le_bytes());
            }
            _ => {
                self.raw(&[0x8a, 8]);
                self.raw(&v.to_le_bytes());
            }
        }
    }

    /// Python 2 `str`.
    pub fn string(&mut self, b: &[u8]) {
        if b.len() < 0x100 {
            self.raw(&[b'U', b.len() as u8]);
        } else {
            self.raw(b"T");
            self.raw(&(b.len() as u32).to_le_bytes());
        }
        self.raw(b);
    }

    pub fn unicode(&mut self, s: &str) {
        self.raw(b"X");
        self.raw(&(s.len() as u32).to_le_bytes());
        self.raw(s.as_bytes());
    }

    pub fn global(&mut self, module: &str, name: &str) {
        self.raw(format!("c{module}\n{name}\n").as_bytes());
    }

    fn put(&mut self) -> u8 {
        self.memo += 1;
        let m = self.memo;
        self.raw(&[b'q', m]);
        m
    }

    fn reconstruct(&mut self, shape: &[usize]) {
        self.global("numpy.core.multiarray", "_reconstruct");
        self.put();
        self.global("numpy", "ndarray");
        self.put();
        self.int(0);
        self.raw(&[0x85]);
        self.string(b"b");
        self.raw(&[0x87, b'R']);
        self.put();

        self.mark();
        self.int(1);
        self.mark();
        for d in shape {
            self.int(*d as i64);
        }
        self.raw(b"t");
    }

    fn finish(&mut self, data: &[u8]) {
        // not fortran ordered
        self.raw(&[0x89]);
        self.string(data);
        self.raw(b"tb");
    }

    /// Pushes an ndarray with a freshly pickled dtype.
    pub fn array(&mut self, shape: &[usize], code: &str, order: &str, data: &[u8]) {
        self.reconstruct(shape);

        self.global("numpy", "dtype");
        self.put();
        self.string(code.as_bytes());
        self.int(0);
        self.int(1);
        self.raw(&[0x87, b'R']);
        self.dtype = self.put();
        self.mark();
        self.int(3);
        self.string(order.as_bytes());
        self.raw(b"NNN");
        self.int(-1);
        self.int(-1);
        self.int(0);
        self.raw(b"tb");

        self.finish(data);
    }

    /// Pushes an ndarray reusing the dtype of the previous [`Pickler::array`].
    pub fn array_with_memo_dtype(&mut self, shape: &[usize], data: &[u8]) {
        self.reconstruct(shape);
        self.raw(&[b'h', self.dtype]);
        self.finish(data);
    }
}

pub(crate) const SPLITS: [(usize, i64); 3] = [(4, 0), (2, 10), (3, 100)];
pub(crate) const FEATURES: usize = 6;

/// Pixel `j` of row `i` in a split. Stored as `k / 256`, like the original archive.
pub(crate) fn pixel(i: usize, j: usize) -> f32 {
    ((i * FEATURES + j) % 256) as f32 / 256.0
}

/// `((x_train, y_train), (x_valid, y_valid), (x_test, y_test))` with float32
/// inputs and int64 labels. Labels of each split start at its offset in `SPLITS`.
pub(crate) static ARCHIVE: Lazy<Vec<u8>> = Lazy::new(|| {
    let mut p = Pickler::new(2);
    for (rows, offset) in SPLITS {
        let x: Vec<u8> = (0..rows)
            .flat_map(|i| (0..FEATURES).map(move |j| pixel(i, j)))
            .flat_map(f32::to_le_bytes)
            .collect();
        let y: Vec<u8> = (0..rows as i64)
            .map(|i| offset + i)
            .flat_map(i64::to_le_bytes)
            .collect();
        p.array(&[rows, FEATURES], "f4", "<", &x);
        p.array(&[rows], "i8", "<", &y);
        p.raw(&[0x86]);
    }
    p.raw(&[0x87]);
    p.stop();
    p.buf
});

pub(crate) static ARCHIVE_GZ: Lazy<Vec<u8>> = Lazy::new(|| {
    let mut enc = GzEncoder::new(Vec::new(), Compression::default());
    enc.write_all(&ARCHIVE).unwrap();
    enc.finish().unwrap()
});
