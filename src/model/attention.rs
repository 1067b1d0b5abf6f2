use crate::common::*;

#[derive(Debug, Clone)]
pub struct SelfAttentionInit {
    pub input_channels: usize,
    /// Query and key width, `input_channels / 8` when absent.
    pub qk_channels: Option<usize>,
    /// Values keep the full input width, otherwise half of it and an output projection.
    pub full_values: bool,
}

impl SelfAttentionInit {
    pub fn build<'a>(self, path: impl Borrow<nn::Path<'a>>) -> Result<SelfAttention> {
        let path = path.borrow();
        let Self {
            input_channels,
            qk_channels,
            full_values,
        } = self;

        ensure!(input_channels > 0, "input_channels must be positive");
        let qk_channels = qk_channels.unwrap_or(input_channels / 8).max(1);
        let value_channels = if full_values {
            input_channels
        } else {
            (input_channels / 2).max(1)
        };

        let in_c = input_channels as i64;
        let qk_c = qk_channels as i64;
        let v_c = value_channels as i64;

        let query_conv = nn::conv2d(path / "query_conv", in_c, qk_c, 1, Default::default());
        let key_conv = nn::conv2d(path / "key_conv", in_c, qk_c, 1, Default::default());
        let value_conv = nn::conv2d(path / "value_conv", in_c, v_c, 1, Default::default());
        let out_conv = (v_c != in_c)
            .then(|| nn::conv2d(path / "out_conv", v_c, in_c, 1, Default::default()));
        let gamma = path.zeros("gamma", &[1]);

        Ok(SelfAttention {
            query_conv,
            key_conv,
            value_conv,
            out_conv,
            gamma,
        })
    }
}

#[derive(Debug)]
pub struct SelfAttention {
    query_conv: nn::Conv2D,
    key_conv: nn::Conv2D,
    value_conv: nn::Conv2D,
    out_conv: Option<nn::Conv2D>,
    gamma: Tensor,
}

impl SelfAttention {
    /// Returns `gamma * attention_output + input` and the attention matrix of
    /// shape `[B, H*W (queries), H*W (keys)]` whose rows sum to one.
    pub fn forward(&self, input: &Tensor) -> Result<(Tensor, Tensor)> {
        let Self {
            ref query_conv,
            ref key_conv,
            ref value_conv,
            ref out_conv,
            ref gamma,
        } = *self;

        let (batch_size, _channels, height, width) = input.size4().with_context(|| {
            format!(
                "expect input shape [B, C, H, W], but get {:?}",
                input.size()
            )
        })?;
        let positions = height * width;

        let query = query_conv
            .forward(input)
            .view([batch_size, -1, positions])
            .permute(&[0, 2, 1]);
        let key = key_conv.forward(input).view([batch_size, -1, positions]);
        let attention = query.bmm(&key).softmax(-1, Kind::Float);

        let value = value_conv.forward(input).view([batch_size, -1, positions]);
        let output = value
            .bmm(&attention.permute(&[0, 2, 1]))
            .view([batch_size, -1, height, width]);
        let output = match out_conv {
            Some(conv) => conv.forward(&output),
            None => output,
        };

        Ok((gamma * output + input, attention))
    }
}
