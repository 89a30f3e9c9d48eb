use ndarray::Array2;
use tracing::debug;

use crate::face_recognition::face_recognition::{Embedding, EMBEDDING_DIM};
use crate::utils::process_img::l2_normalize;

const EMAP_PAYLOAD_BYTES: usize = EMBEDDING_DIM * EMBEDDING_DIM * 4;
/// 名字命中之后向前搜索数据字段的窗口
const SEARCH_SLACK: usize = 4096;

/// emap 提取结果。
/// `Missing`（模型里没有该 initializer）与 `Corrupt`（找到了但数据没过校验）
/// 对画质的影响不同，分开上报；两种情况换脸都继续进行，只是质量下降。
pub enum EmapStatus {
    Loaded(Array2<f32>),
    Missing,
    Corrupt,
}

/// 在模型原始字节里定位名为 `emap` 的 initializer 并解析其 512x512 float32 数据。
///
/// 模型文件格式在构建期就固定了，为一个字段链接完整的 protobuf 栈不成比例，
/// 这里按线格式手工扫描：字段 1 (name, wire type 2) 的 tag 字节 0x0A、
/// 长度 4、ASCII "emap"；随后在窗口内找携带恰好 1,048,576 字节的字段，
/// 优先 raw_data (field 13 → tag 0x6A)，回退 packed float_data (field 5 → tag 0x2A)。
pub fn extract_emap(model_bytes: &[u8]) -> EmapStatus {
    let pattern = b"emap";
    if model_bytes.len() < pattern.len() + 2 {
        return EmapStatus::Missing;
    }

    let mut found_candidate = false;
    for i in 2..model_bytes.len() - pattern.len() {
        if &model_bytes[i..i + pattern.len()] != pattern {
            continue;
        }
        if model_bytes[i - 2] != 0x0A || model_bytes[i - 1] != pattern.len() as u8 {
            continue;
        }
        found_candidate = true;
        debug!("找到候选 emap initializer，偏移 {i}");

        let end = (i + EMAP_PAYLOAD_BYTES + SEARCH_SLACK).min(model_bytes.len());
        for tag in [0x6Au8, 0x2A] {
            if let Some(matrix) = search_field_data(model_bytes, i, end, tag) {
                if validate_emap(&matrix) {
                    return EmapStatus::Loaded(matrix);
                }
            }
        }
    }

    if found_candidate {
        EmapStatus::Corrupt
    } else {
        EmapStatus::Missing
    }
}

/// protobuf varint，返回 (值, 数据起始偏移)
fn read_varint(data: &[u8], mut pos: usize) -> Option<(usize, usize)> {
    let mut result: u64 = 0;
    let mut shift = 0;
    while pos < data.len() && shift < 35 {
        let b = data[pos];
        result |= ((b & 0x7F) as u64) << shift;
        pos += 1;
        if b & 0x80 == 0 {
            return Some((result as usize, pos));
        }
        shift += 7;
    }
    None
}

fn search_field_data(data: &[u8], start: usize, end: usize, tag: u8) -> Option<Array2<f32>> {
    let mut i = start;
    while i + 5 < end {
        if data[i] != tag {
            i += 1;
            continue;
        }
        if let Some((len, data_start)) = read_varint(data, i + 1) {
            if len == EMAP_PAYLOAD_BYTES && data_start + len <= data.len() {
                return Some(parse_payload(&data[data_start..data_start + len]));
            }
        }
        i += 1;
    }
    None
}

/// 小端 float32，行主序 512x512
fn parse_payload(bytes: &[u8]) -> Array2<f32> {
    let mut matrix = Array2::<f32>::zeros((EMBEDDING_DIM, EMBEDDING_DIM));
    for (k, chunk) in bytes.chunks_exact(4).enumerate() {
        let v = f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        matrix[[k / EMBEDDING_DIM, k % EMBEDDING_DIM]] = v;
    }
    matrix
}

/// 使用前的强制校验：稀疏采样（步长 32）检查 NaN/Inf，
/// 平均绝对值必须落在 [0.001, 50] 区间
pub fn validate_emap(matrix: &Array2<f32>) -> bool {
    if matrix.nrows() != EMBEDDING_DIM || matrix.ncols() != EMBEDDING_DIM {
        return false;
    }
    let mut sum_abs = 0.0f64;
    let mut count = 0usize;
    let mut i = 0;
    while i < EMBEDDING_DIM {
        let mut j = 0;
        while j < EMBEDDING_DIM {
            let v = matrix[[i, j]];
            if !v.is_finite() {
                return false;
            }
            sum_abs += v.abs() as f64;
            count += 1;
            j += 32;
        }
        i += 32;
    }
    let avg_abs = sum_abs / count as f64;
    (0.001..=50.0).contains(&avg_abs)
}

/// 身份向量的 emap 线性变换：latent = normalize(v · emap)
pub fn apply_emap(emap: &Array2<f32>, v: &Embedding) -> Embedding {
    l2_normalize(v.dot(emap))
}
