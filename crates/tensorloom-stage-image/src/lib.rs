use anyhow::{ensure, Result};
use image::imageops::FilterType;
use tensorloom_core::{
    validate_batch, DType, InferError, Shape, SlotInputs, SlotResult, StageAdapter,
    StageCapabilities, StageKind, StageSpec, Tensor,
};

/// Engine options for the preprocessing pipeline. `mean` and `std` apply per
/// channel to byte-range pixel values; the defaults are the ImageNet
/// constants scaled by 255.
#[derive(Clone, Debug)]
pub struct ImageOptions {
    pub target_height: usize,
    pub target_width: usize,
    pub mean: [f32; 3],
    pub std: [f32; 3],
}

impl Default for ImageOptions {
    fn default() -> Self {
        Self {
            target_height: 224,
            target_width: 224,
            mean: [0.485 * 255.0, 0.456 * 255.0, 0.406 * 255.0],
            std: [0.229 * 255.0, 0.224 * 255.0, 0.225 * 255.0],
        }
    }
}

/// Reference CPU engine for the decode/resize/normalize stage. Takes one
/// variable-length `UINT8` input of encoded image bytes per slot and produces
/// one `FP32` `[3, H, W]` CHW tensor. Slots decode independently, so a bad
/// image fails its own slot only.
#[derive(Debug)]
pub struct ImagePipeline {
    spec: StageSpec,
    options: ImageOptions,
}

impl ImagePipeline {
    /// Checks the declared stage spec against what this engine can serve:
    /// a single dynamic byte input and a fixed output matching the
    /// configured target size.
    pub fn new(spec: StageSpec, options: ImageOptions) -> Result<Self> {
        ensure!(
            spec.kind == StageKind::Preprocessing,
            "stage `{}` is declared `{}`, not `preprocessing`",
            spec.id,
            spec.kind
        );
        ensure!(
            options.target_height > 0 && options.target_width > 0,
            "target size must be non-zero"
        );
        ensure!(
            spec.inputs.len() == 1 && spec.outputs.len() == 1,
            "image pipeline serves exactly one input and one output"
        );

        let input = &spec.inputs[0];
        ensure!(
            input.dtype == DType::U8 && input.dims == [None],
            "input `{}` must be UINT8 with dims [-1]",
            input.name
        );

        let output = &spec.outputs[0];
        let wanted = [
            Some(3),
            Some(options.target_height),
            Some(options.target_width),
        ];
        ensure!(
            output.dtype == DType::F32 && output.dims == wanted,
            "output `{}` must be FP32 [3, {}, {}] to match the configured target size",
            output.name,
            options.target_height,
            options.target_width
        );

        Ok(Self { spec, options })
    }
}

impl StageAdapter for ImagePipeline {
    fn spec(&self) -> &StageSpec {
        &self.spec
    }

    fn capabilities(&self) -> StageCapabilities {
        StageCapabilities {
            per_slot_faults: true,
            dynamic_shapes: true,
        }
    }

    fn execute(&mut self, batch: Vec<SlotInputs>) -> Result<Vec<SlotResult>, InferError> {
        validate_batch(&self.spec, &batch)?;

        let out_name = self.spec.outputs[0].name.clone();
        Ok(batch
            .into_iter()
            .map(|slot| match decode_one(slot[0].1.bytes(), &self.options) {
                Ok(tensor) => Ok(vec![(out_name.clone(), tensor)]),
                Err(e) => Err(InferError::ExecutorFault {
                    stage: self.spec.id.clone(),
                    retry_safe: false,
                    message: format!("image decode failed: {e}"),
                }),
            })
            .collect())
    }
}

fn decode_one(encoded: &[u8], options: &ImageOptions) -> Result<Tensor, image::ImageError> {
    let decoded = image::load_from_memory(encoded)?;
    let resized = decoded.resize_exact(
        options.target_width as u32,
        options.target_height as u32,
        FilterType::Triangle,
    );
    let rgb = resized.to_rgb8();

    let (height, width) = (options.target_height, options.target_width);
    let plane = height * width;
    let mut chw = vec![0.0f32; 3 * plane];
    for (x, y, px) in rgb.enumerate_pixels() {
        let at = y as usize * width + x as usize;
        for c in 0..3 {
            chw[c * plane + at] = (px.0[c] as f32 - options.mean[c]) / options.std[c];
        }
    }

    Ok(Tensor::from_f32(
        Shape::from_slice(&[3, height, width]),
        &chw,
    ))
}
