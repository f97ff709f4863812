// BEGIN - Embark standard lints v0.4
// do not change or add/remove here, but one can add exceptions after this section
// for more info see: <https://github.com/EmbarkStudios/rust-ecosystem/issues/59>
#![deny(unsafe_code)]
#![warn(
    clippy::all,
    clippy::await_holding_lock,
    clippy::char_lit_as_u8,
    clippy::checked_conversions,
    clippy::dbg_macro,
    clippy::debug_assert_with_mut_call,
    clippy::doc_markdown,
    clippy::empty_enum,
    clippy::enum_glob_use,
    clippy::exit,
    clippy::expl_impl_clone_on_copy,
    clippy::explicit_deref_methods,
    clippy::explicit_into_iter_loop,
    clippy::fallible_impl_from,
    clippy::filter_map_next,
    clippy::float_cmp_const,
    clippy::fn_params_excessive_bools,
    clippy::if_let_mutex,
    clippy::implicit_clone,
    clippy::imprecise_flops,
    clippy::inefficient_to_string,
    clippy::invalid_upcast_comparisons,
    clippy::large_types_passed_by_value,
    clippy::let_unit_value,
    clippy::linkedlist,
    clippy::lossy_float_literal,
    clippy::macro_use_imports,
    clippy::manual_ok_or,
    clippy::map_err_ignore,
    clippy::map_flatten,
    clippy::map_unwrap_or,
    clippy::match_on_vec_items,
    clippy::match_same_arms,
    clippy::match_wildcard_for_single_variants,
    clippy::mem_forget,
    clippy::mismatched_target_os,
    clippy::mut_mut,
    clippy::mutex_integer,
    clippy::needless_borrow,
    clippy::needless_continue,
    clippy::option_option,
    clippy::path_buf_push_overwrite,
    clippy::ptr_as_ptr,
    clippy::ref_option_ref,
    clippy::rest_pat_in_fully_bound_structs,
    clippy::same_functions_in_if_condition,
    clippy::semicolon_if_nothing_returned,
    clippy::string_add_assign,
    clippy::string_add,
    clippy::string_lit_as_bytes,
    clippy::string_to_string,
    clippy::todo,
    clippy::trait_duplication_in_bounds,
    clippy::unimplemented,
    clippy::unnested_or_patterns,
    clippy::unused_self,
    clippy::useless_transmute,
    clippy::verbose_file_reads,
    clippy::zero_sized_map_values,
    future_incompatible,
    nonstandard_style,
    rust_2018_idioms
)]
// END - Embark standard lints v0.4

//! `neural-style` is a light API for neural style transfer, which optimizes
//! an image so its content matches one image while its style matches
//! another, as seen through the activations of a frozen convolutional
//! network.
//!
//! First, you build a `Session` via a `SessionBuilder`, which follows the builder pattern. Calling
//! `build` on the `SessionBuilder` loads both input images and checks for various errors.
//!
//! `Session` has a `run()` method that optimizes the image with L-BFGS, which is returned as a
//! `StyledImage`.
//!
//! ## How it works
//!
//! 1. The backbone is rebuilt into a pipeline with loss taps inserted after the requested layers,
//!    content taps compare activations directly, style taps compare their Gram matrices
//! 2. Every evaluation clamps the image into `[0, 1]`, runs the pipeline, and backpropagates the
//!    weighted sum of the tap losses to the pixels
//! 3. The optimizer keeps stepping until its evaluation budget is exhausted
//!
//! The lower level pieces, [`model::assemble`] and [`transfer::run_style_transfer`], can also be
//! used directly with any backbone that only contains convolutions, activations, pooling and batch
//! normalization.
//!
//! ## Usage
//! Session follows a "builder pattern" for defining parameters, meaning you chain functions together.
//!
//! ```no_run
//! let backbone = neural_style::Backbone::load(
//!     "vgg19".parse().expect("unknown architecture"),
//!     "weights/vgg19.safetensors",
//! ).expect("failed to load backbone");
//!
//! // Create a new session with default parameters
//! let session = neural_style::Session::builder()
//!     // Set some parameters
//!     .image_size(256)
//!     .num_steps(100)
//!     // Specify the input images
//!     .content(&"imgs/dancing.jpg")
//!     .style(&"imgs/picasso.jpg")
//!     .backbone(backbone)
//!     // Build the session
//!     .build().expect("failed to build session");
//!
//! // Optimize the image
//! let styled = session.run(None).expect("failed to run style transfer");
//!
//! // Save the styled image to disk
//! styled.save("my_styled_img.png").expect("failed to save styled image");
//! ```
pub mod backbone;
pub mod color;
mod context;
mod errors;
pub mod layers;
pub mod lbfgs;
pub mod loss;
pub mod model;
mod normalization;
pub mod session;
pub mod tensor;
pub mod transfer;
mod utils;

pub use image;

pub use backbone::{Architecture, Backbone, VggDepth};
pub use context::ExecutionContext;
pub use errors::{Error, InvalidRange, SizeMismatch, TapKind};
pub use lbfgs::LineSearch;
pub use normalization::{Normalization, IMAGENET_MEAN, IMAGENET_STD};
pub use session::{Init, Session, SessionBuilder, StyledImage};
pub use tensor::Tensor;
pub use transfer::{
    ProgressUpdate, SnapshotDir, SnapshotSink, Summary, TransferParams, TransferProgress,
};
pub use utils::{
    center_crop, check_output_format, image_to_tensor, load_dynamic_image, shorter_edge_dims,
    tensor_to_rgb, ImageSource,
};
