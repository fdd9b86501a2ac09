// SPDX-License-Identifier: MIT
//! # cap-scale: Fixed-Size Tensor Scaling for On-Device Inference
//!
//! This crate provides aspect-preserving BGR/BGRA frame scaling used to prepare decoded
//! camera frames for fixed-size neural tensor input (object detector, vision-language
//! captioner).
//!
//! ## Key Components
//!
//! - [`presets`]: Scaling plan computation (`build_plan`) for a target size and aspect mode.
//! - [`cpu`]: CPU-based scaling implementation using SIMD acceleration via `fast_image_resize`.
//!
//! ## Performance Characteristics
//!
//! - **SIMD-accelerated**: Leverages AVX2/AVX-512 when available.
//! - **Memory efficient**: Pre-allocated buffers and staging areas, reused across frames.
//! - **Stride-aware**: Handles both tightly-packed and strided input layouts.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use cap_scale::{cpu::scale_bgra_cpu, presets::{build_plan, ScaleTarget, AspectMode, Size}};
//!
//! # fn run(input_bgra_data: &[u8]) -> Result<(), Box<dyn std::error::Error>> {
//! let input_size = Size { w: 1920, h: 1080 };
//! let plan = build_plan(
//!     input_size,
//!     ScaleTarget::Exact(Size { w: 640, h: 480 }),
//!     AspectMode::Pad { bg_rgba: [0, 0, 0, 255] },
//! );
//!
//! let mut resizer = fast_image_resize::Resizer::new();
//! let mut output = vec![0u8; (plan.out.w * plan.out.h * 4) as usize];
//!
//! scale_bgra_cpu(
//!     &mut resizer,
//!     input_bgra_data,
//!     input_size,
//!     Some(1920 * 4),
//!     &plan,
//!     &mut output,
//!     None,
//! )?;
//! # Ok(())
//! # }
//! ```

pub mod cpu;
pub mod presets;
