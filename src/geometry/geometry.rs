use image::{GrayImage, Luma, Rgb, RgbImage};

/// ArcFace 标准 112x112 五点对齐模板。
/// 顺序固定：左眼、右眼、鼻尖、左嘴角、右嘴角。
pub const ARCFACE_TEMPLATE_112: [[f32; 2]; 5] = [
    [38.2946, 51.6963],
    [73.5318, 51.5014],
    [56.0252, 71.7366],
    [41.5493, 92.3655],
    [70.7299, 92.2041],
];

/// 像素坐标下的轴对齐矩形，(left, top, right, bottom)，右/下开区间
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl BBox {
    pub fn new(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        Self { x1, y1, x2, y2 }
    }

    pub fn width(&self) -> f32 {
        (self.x2 - self.x1).max(0.0)
    }

    pub fn height(&self) -> f32 {
        (self.y2 - self.y1).max(0.0)
    }

    pub fn area(&self) -> f32 {
        self.width() * self.height()
    }

    pub fn center(&self) -> (f32, f32) {
        ((self.x1 + self.x2) / 2.0, (self.y1 + self.y2) / 2.0)
    }

    pub fn diagonal(&self) -> f32 {
        let w = self.width().max(1.0);
        let h = self.height().max(1.0);
        (w * w + h * h).sqrt()
    }

    pub fn contains(&self, x: f32, y: f32) -> bool {
        x >= self.x1 && x < self.x2 && y >= self.y1 && y < self.y2
    }

    pub fn clamp_to(&self, img_w: f32, img_h: f32) -> BBox {
        BBox {
            x1: self.x1.clamp(0.0, img_w),
            y1: self.y1.clamp(0.0, img_h),
            x2: self.x2.clamp(0.0, img_w),
            y2: self.y2.clamp(0.0, img_h),
        }
    }

    /// 交并比，无重叠时为 0
    pub fn iou(&self, other: &BBox) -> f32 {
        let ix1 = self.x1.max(other.x1);
        let iy1 = self.y1.max(other.y1);
        let ix2 = self.x2.min(other.x2);
        let iy2 = self.y2.min(other.y2);
        let iw = (ix2 - ix1).max(0.0);
        let ih = (iy2 - iy1).max(0.0);
        let inter = iw * ih;
        if inter <= 0.0 {
            return 0.0;
        }
        let union = self.area() + other.area() - inter;
        if union <= 0.0 {
            return 0.0;
        }
        inter / union
    }

    /// 中心点欧氏距离
    pub fn center_distance(&self, other: &BBox) -> f32 {
        let (ax, ay) = self.center();
        let (bx, by) = other.center();
        ((ax - bx).powi(2) + (ay - by).powi(2)).sqrt()
    }
}

/// 2x3 仿射矩阵。内部用 f64 存储，保证逆变换往返误差在亚像素以下。
#[derive(Clone, Copy, Debug)]
pub struct Affine2x3 {
    pub m: [[f64; 3]; 2],
}

impl Affine2x3 {
    pub fn apply(&self, x: f32, y: f32) -> (f32, f32) {
        let (x, y) = (x as f64, y as f64);
        let ox = self.m[0][0] * x + self.m[0][1] * y + self.m[0][2];
        let oy = self.m[1][0] * x + self.m[1][1] * y + self.m[1][2];
        (ox as f32, oy as f32)
    }

    pub fn det(&self) -> f64 {
        self.m[0][0] * self.m[1][1] - self.m[0][1] * self.m[1][0]
    }

    /// 求 2x3 仿射矩阵的逆（仍为 2x3），退化矩阵返回 None
    pub fn invert(&self) -> Option<Affine2x3> {
        let a = self.m[0][0];
        let b = self.m[0][1];
        let tx = self.m[0][2];
        let c = self.m[1][0];
        let d = self.m[1][1];
        let ty = self.m[1][2];
        let det = a * d - b * c;
        if det.abs() < 1e-10 {
            return None;
        }
        let inv_det = 1.0 / det;
        let ia = d * inv_det;
        let ib = -b * inv_det;
        let ic = -c * inv_det;
        let id = a * inv_det;
        Some(Affine2x3 {
            m: [
                [ia, ib, -(ia * tx + ib * ty)],
                [ic, id, -(ic * tx + id * ty)],
            ],
        })
    }
}

/// 解析求解 2x2 矩阵的 SVD（Jacobi 旋转法）。
/// 返回 (U, S, V)，均按行主序展开。
fn svd2x2(a: f64, b: f64, c: f64, d: f64) -> ([f64; 4], [f64; 2], [f64; 4]) {
    let e = (a + d) / 2.0;
    let f = (a - d) / 2.0;
    let g = (c + b) / 2.0;
    let h = (c - b) / 2.0;

    let q = (e * e + h * h).sqrt();
    let r = (f * f + g * g).sqrt();

    let s0 = q + r;
    let s1 = (q - r).abs();

    let a1 = g.atan2(f);
    let a2 = h.atan2(e);
    let theta = (a2 - a1) / 2.0;
    let phi = (a2 + a1) / 2.0;

    let (st, ct) = theta.sin_cos();
    let (sp, cp) = phi.sin_cos();

    ([cp, -sp, sp, cp], [s0, s1], [ct, -st, st, ct])
}

/// Umeyama 相似变换估计（旋转 + 均匀缩放 + 平移），五点最小二乘拟合。
/// 参考 Umeyama, "Least-Squares Estimation of Transformation Parameters
/// Between Two Point Patterns", IEEE TPAMI 1991.
pub fn umeyama(src: &[[f32; 2]], dst: &[[f32; 2]]) -> Affine2x3 {
    debug_assert_eq!(src.len(), dst.len());
    let n = src.len() as f64;

    let mut src_mx = 0.0;
    let mut src_my = 0.0;
    let mut dst_mx = 0.0;
    let mut dst_my = 0.0;
    for (s, d) in src.iter().zip(dst) {
        src_mx += s[0] as f64;
        src_my += s[1] as f64;
        dst_mx += d[0] as f64;
        dst_my += d[1] as f64;
    }
    src_mx /= n;
    src_my /= n;
    dst_mx /= n;
    dst_my /= n;

    // 协方差 H = dst^T * src 与源方差同时累积
    let mut src_var = 0.0;
    let (mut a, mut b, mut c, mut d) = (0.0, 0.0, 0.0, 0.0);
    for (s, t) in src.iter().zip(dst) {
        let sx = s[0] as f64 - src_mx;
        let sy = s[1] as f64 - src_my;
        let dx = t[0] as f64 - dst_mx;
        let dy = t[1] as f64 - dst_my;
        src_var += sx * sx + sy * sy;
        a += dx * sx;
        b += dx * sy;
        c += dy * sx;
        d += dy * sy;
    }
    src_var /= n;
    a /= n;
    b /= n;
    c /= n;
    d /= n;

    let (u, s, v) = svd2x2(a, b, c, d);
    let det_uv = (u[0] * u[3] - u[1] * u[2]) * (v[0] * v[3] - v[1] * v[2]);
    let sign = if det_uv < 0.0 { -1.0 } else { 1.0 };

    // R = U * D * V^T，D = diag(1, sign) 消除反射
    let r00 = u[0] * v[0] + u[1] * v[2] * sign;
    let r01 = u[0] * v[1] + u[1] * v[3] * sign;
    let r10 = u[2] * v[0] + u[3] * v[2] * sign;
    let r11 = u[2] * v[1] + u[3] * v[3] * sign;

    let sc = if src_var > 1e-10 {
        (s[0] + s[1] * sign) / src_var
    } else {
        1.0
    };

    let tx = dst_mx - sc * (r00 * src_mx + r01 * src_my);
    let ty = dst_my - sc * (r10 * src_mx + r11 * src_my);

    Affine2x3 {
        m: [
            [sc * r00, sc * r01, tx],
            [sc * r10, sc * r11, ty],
        ],
    }
}

/// 对齐矩阵：源图五点 → ArcFace 模板缩放到 target_size。
/// 112 / 128 / 512 三档都从同一个 112 模板按比例放大。
pub fn align_matrix(landmarks: &[[f32; 2]; 5], target_size: u32) -> Affine2x3 {
    let scale = target_size as f32 / 112.0;
    let mut dst = [[0.0f32; 2]; 5];
    for (d, t) in dst.iter_mut().zip(&ARCFACE_TEMPLATE_112) {
        d[0] = t[0] * scale;
        d[1] = t[1] * scale;
    }
    umeyama(landmarks, &dst)
}

#[inline]
fn bilinear_rgb(src: &RgbImage, x: f32, y: f32) -> Option<[f32; 3]> {
    let (w, h) = (src.width() as i64, src.height() as i64);
    let x0 = x.floor() as i64;
    let y0 = y.floor() as i64;
    if x0 < -1 || y0 < -1 || x0 >= w || y0 >= h {
        return None;
    }
    let fx = x - x0 as f32;
    let fy = y - y0 as f32;
    let sample = |px: i64, py: i64| -> [f32; 3] {
        if px < 0 || py < 0 || px >= w || py >= h {
            return [0.0; 3];
        }
        let p = src.get_pixel(px as u32, py as u32);
        [p[0] as f32, p[1] as f32, p[2] as f32]
    };
    let p00 = sample(x0, y0);
    let p10 = sample(x0 + 1, y0);
    let p01 = sample(x0, y0 + 1);
    let p11 = sample(x0 + 1, y0 + 1);
    let mut out = [0.0f32; 3];
    for i in 0..3 {
        let top = p00[i] * (1.0 - fx) + p10[i] * fx;
        let bottom = p01[i] * (1.0 - fx) + p11[i] * fx;
        out[i] = top * (1.0 - fy) + bottom * fy;
    }
    Some(out)
}

#[inline]
fn bilinear_gray(src: &GrayImage, x: f32, y: f32) -> f32 {
    let (w, h) = (src.width() as i64, src.height() as i64);
    let x0 = x.floor() as i64;
    let y0 = y.floor() as i64;
    if x0 < -1 || y0 < -1 || x0 >= w || y0 >= h {
        return 0.0;
    }
    let fx = x - x0 as f32;
    let fy = y - y0 as f32;
    let sample = |px: i64, py: i64| -> f32 {
        if px < 0 || py < 0 || px >= w || py >= h {
            return 0.0;
        }
        src.get_pixel(px as u32, py as u32)[0] as f32
    };
    let top = sample(x0, y0) * (1.0 - fx) + sample(x0 + 1, y0) * fx;
    let bottom = sample(x0, y0 + 1) * (1.0 - fx) + sample(x0 + 1, y0 + 1) * fx;
    top * (1.0 - fy) + bottom * fy
}

/// 双线性仿射重采样。`map` 把输出像素坐标映射到源图坐标：
/// 做对齐时传对齐矩阵的逆，贴回原图时直接传对齐矩阵。出界取黑。
pub fn warp_affine_rgb(src: &RgbImage, map: &Affine2x3, out_w: u32, out_h: u32) -> RgbImage {
    let mut out = RgbImage::new(out_w, out_h);
    for y in 0..out_h {
        for x in 0..out_w {
            let (sx, sy) = map.apply(x as f32, y as f32);
            if let Some(p) = bilinear_rgb(src, sx, sy) {
                out.put_pixel(
                    x,
                    y,
                    Rgb([
                        p[0].round().clamp(0.0, 255.0) as u8,
                        p[1].round().clamp(0.0, 255.0) as u8,
                        p[2].round().clamp(0.0, 255.0) as u8,
                    ]),
                );
            }
        }
    }
    out
}

/// 单通道版本，用于遮罩的逆变换。出界为 0（完全透明）。
pub fn warp_affine_gray(src: &GrayImage, map: &Affine2x3, out_w: u32, out_h: u32) -> GrayImage {
    let mut out = GrayImage::new(out_w, out_h);
    for y in 0..out_h {
        for x in 0..out_w {
            let (sx, sy) = map.apply(x as f32, y as f32);
            let v = bilinear_gray(src, sx, sy);
            out.put_pixel(x, y, Luma([v.round().clamp(0.0, 255.0) as u8]));
        }
    }
    out
}

/// 矩形渐变遮罩：内部为 255，四边各有 border_frac 比例的 smoothstep 渐变，
/// 角落取两个方向的较小值，先行淡出。
pub fn feather_mask(size: u32, border_frac: f32) -> GrayImage {
    let border = ((size as f32 * border_frac) as u32).max(4) as f32;
    let mut mask = GrayImage::new(size, size);
    for y in 0..size {
        for x in 0..size {
            let dx = (x.min(size - 1 - x)) as f32;
            let dy = (y.min(size - 1 - y)) as f32;
            let fx = if dx < border { dx / border } else { 1.0 };
            let fy = if dy < border { dy / border } else { 1.0 };
            let t = fx.min(fy);
            let alpha = t * t * (3.0 - 2.0 * t);
            mask.put_pixel(x, y, Luma([(alpha * 255.0).round().clamp(0.0, 255.0) as u8]));
        }
    }
    mask
}

/// 把换脸/增强后的区域贴回原帧：output = frame·(1−α) + warped·α。
/// warped 与 mask 均为帧尺寸（已做过逆变换），遮罩为 0 的像素跳过。
pub fn composite_masked(frame: &mut RgbImage, warped: &RgbImage, mask: &GrayImage) {
    debug_assert_eq!(frame.dimensions(), warped.dimensions());
    debug_assert_eq!(frame.dimensions(), mask.dimensions());
    for (x, y, pixel) in frame.enumerate_pixels_mut() {
        let a = mask.get_pixel(x, y)[0] as f32 / 255.0;
        if a <= 0.0 {
            continue;
        }
        let f = warped.get_pixel(x, y);
        for i in 0..3 {
            let blended = pixel[i] as f32 * (1.0 - a) + f[i] as f32 * a;
            pixel[i] = blended.round().clamp(0.0, 255.0) as u8;
        }
    }
}

/// 人脸框扩展为正方形：边长 = max(w, h)·scale，以原中心为中心，
/// 裁剪到图像边界后强制为正方形；最终边长不足 min_size 时丢弃。
pub fn expand_square_box(
    b: &BBox,
    img_w: u32,
    img_h: u32,
    scale: f32,
    min_size: f32,
) -> Option<BBox> {
    if b.width() < 1.0 || b.height() < 1.0 {
        return None;
    }
    let (cx, cy) = b.center();
    let side = b.width().max(b.height()) * scale;
    let half = side / 2.0;

    let left = (cx - half).max(0.0).round();
    let top = (cy - half).max(0.0).round();
    let right = (cx + half).min(img_w as f32).round();
    let bottom = (cy + half).min(img_h as f32).round();

    let size = (right - left).min(bottom - top);
    if size < min_size {
        return None;
    }
    Some(BBox::new(left, top, left + size, top + size))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transform_points(m: &Affine2x3, pts: &[[f32; 2]; 5]) -> [[f32; 2]; 5] {
        let mut out = [[0.0f32; 2]; 5];
        for (o, p) in out.iter_mut().zip(pts) {
            let (x, y) = m.apply(p[0], p[1]);
            *o = [x, y];
        }
        out
    }

    /// 模板经过旋转 + 缩放 + 平移后，Umeyama 应恢复出把它映回模板的相似变换
    fn rotated_template(angle: f32, scale: f32, tx: f32, ty: f32) -> [[f32; 2]; 5] {
        let (s, c) = angle.sin_cos();
        let mut out = [[0.0f32; 2]; 5];
        for (o, p) in out.iter_mut().zip(&ARCFACE_TEMPLATE_112) {
            o[0] = scale * (c * p[0] - s * p[1]) + tx;
            o[1] = scale * (s * p[0] + c * p[1]) + ty;
        }
        out
    }

    #[test]
    fn alignment_is_a_similarity() {
        let landmark_sets = [
            rotated_template(0.0, 1.0, 0.0, 0.0),
            rotated_template(0.35, 2.4, 120.0, -40.0),
            rotated_template(-0.8, 0.6, 300.0, 200.0),
        ];
        for landmarks in &landmark_sets {
            for target in [112u32, 128, 512] {
                let m = align_matrix(landmarks, target);
                // 正行列式：不含反射
                assert!(m.det() > 0.0, "det must be positive");
                // 均匀缩放：两列范数一致、列间正交
                let col0 = (m.m[0][0] * m.m[0][0] + m.m[1][0] * m.m[1][0]).sqrt();
                let col1 = (m.m[0][1] * m.m[0][1] + m.m[1][1] * m.m[1][1]).sqrt();
                assert!((col0 - col1).abs() < 1e-4, "aspect ratio must be preserved");
                let dot = m.m[0][0] * m.m[0][1] + m.m[1][0] * m.m[1][1];
                assert!(dot.abs() < 1e-4, "columns must be orthogonal");
                // 应用到关键点后与模板的亚像素误差
                let scale = target as f32 / 112.0;
                let mapped = transform_points(&m, landmarks);
                for (got, tpl) in mapped.iter().zip(&ARCFACE_TEMPLATE_112) {
                    assert!((got[0] - tpl[0] * scale).abs() < 0.5);
                    assert!((got[1] - tpl[1] * scale).abs() < 0.5);
                }
            }
        }
    }

    #[test]
    fn affine_inverse_roundtrip() {
        let landmarks = rotated_template(0.5, 1.7, 88.0, -13.0);
        let m = align_matrix(&landmarks, 128);
        let inv = m.invert().unwrap();
        for &(x, y) in &[(0.0f32, 0.0f32), (640.0, 360.0), (123.4, 567.8), (-20.0, 5.0)] {
            let (ax, ay) = m.apply(x, y);
            let (bx, by) = inv.apply(ax, ay);
            assert!((bx - x).abs() < 1e-4, "x roundtrip error too large");
            assert!((by - y).abs() < 1e-4, "y roundtrip error too large");
        }
    }

    #[test]
    fn degenerate_affine_has_no_inverse() {
        let m = Affine2x3 {
            m: [[1.0, 2.0, 0.0], [2.0, 4.0, 0.0]],
        };
        assert!(m.invert().is_none());
    }

    #[test]
    fn iou_basic_cases() {
        let a = BBox::new(0.0, 0.0, 10.0, 10.0);
        let b = BBox::new(5.0, 5.0, 15.0, 15.0);
        let c = BBox::new(20.0, 20.0, 30.0, 30.0);
        assert!((a.iou(&a) - 1.0).abs() < 1e-6);
        assert!((a.iou(&b) - 25.0 / 175.0).abs() < 1e-6);
        assert_eq!(a.iou(&c), 0.0);
        // 对称性
        assert_eq!(a.iou(&b), b.iou(&a));
    }

    #[test]
    fn warp_identity_keeps_image() {
        let img = RgbImage::from_fn(16, 16, |x, y| Rgb([(x * 16) as u8, (y * 16) as u8, 7]));
        let id = Affine2x3 {
            m: [[1.0, 0.0, 0.0], [0.0, 1.0, 0.0]],
        };
        let out = warp_affine_rgb(&img, &id, 16, 16);
        assert_eq!(out.get_pixel(5, 9), img.get_pixel(5, 9));
    }

    #[test]
    fn warp_translation_shifts_pixels() {
        let mut img = RgbImage::new(8, 8);
        img.put_pixel(2, 3, Rgb([200, 100, 50]));
        // 输出像素 (x, y) 采样源图 (x+1, y+1)
        let shift = Affine2x3 {
            m: [[1.0, 0.0, 1.0], [0.0, 1.0, 1.0]],
        };
        let out = warp_affine_rgb(&img, &shift, 8, 8);
        assert_eq!(*out.get_pixel(1, 2), Rgb([200, 100, 50]));
    }

    #[test]
    fn feather_mask_profile() {
        let mask = feather_mask(128, 0.12);
        // 中心完全不透明
        assert_eq!(mask.get_pixel(64, 64)[0], 255);
        // 边缘第一圈接近透明
        assert!(mask.get_pixel(0, 64)[0] < 10);
        assert!(mask.get_pixel(64, 0)[0] < 10);
        // 角落不高于邻边（min(fx, fy) 规则）
        assert!(mask.get_pixel(3, 3)[0] <= mask.get_pixel(3, 64)[0]);
        // 渐变单调上升
        let border = (128.0_f32 * 0.12) as u32;
        for x in 1..border {
            assert!(mask.get_pixel(x, 64)[0] >= mask.get_pixel(x - 1, 64)[0]);
        }
    }

    #[test]
    fn composite_respects_mask() {
        let mut frame = RgbImage::from_pixel(4, 4, Rgb([10, 10, 10]));
        let warped = RgbImage::from_pixel(4, 4, Rgb([250, 250, 250]));
        let mut mask = GrayImage::new(4, 4);
        mask.put_pixel(1, 1, Luma([255]));
        mask.put_pixel(2, 2, Luma([128]));
        composite_masked(&mut frame, &warped, &mask);
        assert_eq!(*frame.get_pixel(0, 0), Rgb([10, 10, 10]));
        assert_eq!(*frame.get_pixel(1, 1), Rgb([250, 250, 250]));
        let mid = frame.get_pixel(2, 2)[0];
        assert!(mid > 100 && mid < 160);
    }

    #[test]
    fn expand_square_box_rules() {
        // 正常扩展：1.35 倍、以中心为中心的正方形
        let b = BBox::new(100.0, 100.0, 200.0, 180.0);
        let sq = expand_square_box(&b, 640, 480, 1.35, 48.0).unwrap();
        assert!((sq.width() - sq.height()).abs() < 1e-3);
        assert!((sq.width() - 135.0).abs() <= 1.0);
        let (cx, cy) = sq.center();
        assert!((cx - 150.0).abs() <= 1.0);
        assert!((cy - 140.0).abs() <= 1.0);

        // 太小的框被拒绝
        let tiny = BBox::new(10.0, 10.0, 30.0, 30.0);
        assert!(expand_square_box(&tiny, 640, 480, 1.35, 48.0).is_none());

        // 边界裁剪后仍为正方形且在图内
        let edge = BBox::new(0.0, 0.0, 80.0, 80.0);
        let sq = expand_square_box(&edge, 640, 480, 1.35, 48.0).unwrap();
        assert!(sq.x1 >= 0.0 && sq.y1 >= 0.0);
        assert!((sq.width() - sq.height()).abs() < 1e-3);
    }
}
