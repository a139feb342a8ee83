pub mod files;
pub mod schema;
pub mod store;

pub use store::Store;

pub(crate) fn now_rfc3339ish() -> String {
    chrono::Utc::now().to_rfc3339()
}

pub(crate) fn encode_vec_f32(v: &[f32]) -> Vec<u8> {
    v.iter().flat_map(|x| x.to_le_bytes()).collect()
}

pub(crate) fn decode_vec_f32(blob: &[u8]) -> anyhow::Result<Vec<f32>> {
    if blob.len() % 4 != 0 {
        anyhow::bail!("embedding blob length {} is not a multiple of 4", blob.len());
    }
    Ok(blob
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect())
}
