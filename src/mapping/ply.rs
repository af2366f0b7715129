// ply.rs - Binary little-endian PLY for point clouds
//
// Vertex layout: x y z nx ny nz (float), red green blue label (uchar)

use super::cloud::{PointCloud, SurfaceClass};
use crate::error::{GenexError, Result};

const RECORD: usize = 6 * 4 + 4;

pub fn encode(cloud: &PointCloud) -> Vec<u8> {
    let header = format!(
        "ply\n\
         format binary_little_endian 1.0\n\
         comment genex semantic point cloud\n\
         element vertex {}\n\
         property float x\n\
         property float y\n\
         property float z\n\
         property float nx\n\
         property float ny\n\
         property float nz\n\
         property uchar red\n\
         property uchar green\n\
         property uchar blue\n\
         property uchar label\n\
         end_header\n",
        cloud.len()
    );

    let mut out = Vec::with_capacity(header.len() + cloud.len() * RECORD);
    out.extend_from_slice(header.as_bytes());
    for i in 0..cloud.len() {
        for v in cloud.points[i].iter().chain(&cloud.normals[i]) {
            out.extend_from_slice(&v.to_le_bytes());
        }
        out.extend_from_slice(&cloud.colors[i]);
        out.push(cloud.labels[i].to_u8());
    }
    out
}

pub fn decode(bytes: &[u8]) -> Result<PointCloud> {
    const END: &[u8] = b"end_header\n";
    let end = bytes
        .windows(END.len())
        .position(|w| w == END)
        .ok_or_else(|| GenexError::Format("PLY header is not terminated".into()))?;
    let header = std::str::from_utf8(&bytes[..end]).map_err(|e| GenexError::Format(e.to_string()))?;

    let mut lines = header.lines();
    if lines.next() != Some("ply") {
        return Err(GenexError::Format("not a PLY file".into()));
    }
    let mut count = None;
    for line in lines {
        let words: Vec<&str> = line.split_whitespace().collect();
        match words.as_slice() {
            ["format", fmt, _] if *fmt != "binary_little_endian" => {
                return Err(GenexError::Format(format!("unsupported PLY format {fmt}")));
            }
            ["element", "vertex", n] => {
                count = Some(n.parse::<usize>().map_err(|e| GenexError::Format(e.to_string()))?);
            }
            _ => {}
        }
    }
    let count = count.ok_or_else(|| GenexError::Format("PLY has no vertex element".into()))?;

    let body = &bytes[end + END.len()..];
    let expected = count
        .checked_mul(RECORD)
        .ok_or_else(|| GenexError::Format(format!("PLY vertex count {count} is too large")))?;
    if body.len() != expected {
        return Err(GenexError::Format(format!("PLY body holds {} bytes, expected {expected}", body.len())));
    }

    let mut cloud = PointCloud::default();
    for rec in body.chunks_exact(RECORD) {
        let f = |i: usize| f32::from_le_bytes([rec[i * 4], rec[i * 4 + 1], rec[i * 4 + 2], rec[i * 4 + 3]]);
        cloud.points.push([f(0), f(1), f(2)]);
        cloud.normals.push([f(3), f(4), f(5)]);
        cloud.colors.push([rec[24], rec[25], rec[26]]);
        let label = SurfaceClass::from_u8(rec[27])
            .ok_or_else(|| GenexError::Format(format!("unknown surface label {}", rec[27])))?;
        cloud.labels.push(label);
    }
    Ok(cloud)
}
