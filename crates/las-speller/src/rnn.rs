//! Многослойная рекуррентная сеть speller'а (LSTM / GRU / tanh-RNN).
//!
//! Раскладка весов совпадает с PyTorch `nn.LSTM` / `nn.GRU` / `nn.RNN`:
//! - rnn.weight_ih_l{i}: [gates*hidden, input]
//! - rnn.weight_hh_l{i}: [gates*hidden, hidden]
//! - rnn.bias_ih_l{i}: [gates*hidden]
//! - rnn.bias_hh_l{i}: [gates*hidden]
//!
//! Порядок гейтов: LSTM (i, f, g, o), GRU (r, z, n).

use candle_core::{DType, Device, IndexOp, Module, Result, Tensor, D};
use candle_nn::{Dropout, Init, ModuleT, VarBuilder};
use las_core::RnnKind;

/// Одна рекуррентная ячейка (один слой).
///
/// LSTM:
/// gates = x @ W_ih^T + b_ih + h @ W_hh^T + b_hh
/// c = sigmoid(f) * c_prev + sigmoid(i) * tanh(g)
/// h = sigmoid(o) * tanh(c)
///
/// GRU:
/// r = sigmoid(x_r + h_r), z = sigmoid(x_z + h_z)
/// n = tanh(x_n + r * h_n)
/// h = (1 - z) * n + z * h_prev
#[derive(Debug, Clone)]
struct RecurrentCell {
    kind: RnnKind,
    weight_ih: Tensor, // [gates*hidden, input_size]
    weight_hh: Tensor, // [gates*hidden, hidden_size]
    bias_ih: Tensor,   // [gates*hidden]
    bias_hh: Tensor,   // [gates*hidden]
    hidden_size: usize,
}

impl RecurrentCell {
    fn load(
        kind: RnnKind,
        input_size: usize,
        hidden_size: usize,
        layer_idx: usize,
        vb: &VarBuilder,
    ) -> Result<Self> {
        let gate_size = kind.num_gates() * hidden_size;
        // Инициализация как в PyTorch: U(-1/sqrt(hidden), 1/sqrt(hidden))
        let bound = 1.0 / (hidden_size as f64).sqrt();
        let init = Init::Uniform {
            lo: -bound,
            up: bound,
        };
        let weight_ih =
            vb.get_with_hints((gate_size, input_size), &format!("weight_ih_l{layer_idx}"), init)?;
        let weight_hh =
            vb.get_with_hints((gate_size, hidden_size), &format!("weight_hh_l{layer_idx}"), init)?;
        let bias_ih = vb.get_with_hints(gate_size, &format!("bias_ih_l{layer_idx}"), init)?;
        let bias_hh = vb.get_with_hints(gate_size, &format!("bias_hh_l{layer_idx}"), init)?;
        Ok(Self {
            kind,
            weight_ih,
            weight_hh,
            bias_ih,
            bias_hh,
            hidden_size,
        })
    }

    /// Один шаг: x [batch, input], h [batch, hidden], c [batch, hidden] (только LSTM).
    fn step(&self, x: &Tensor, h: &Tensor, c: Option<&Tensor>) -> Result<(Tensor, Option<Tensor>)> {
        let x_gates = x
            .contiguous()?
            .matmul(&self.weight_ih.t()?)?
            .broadcast_add(&self.bias_ih)?;
        let h_gates = h
            .contiguous()?
            .matmul(&self.weight_hh.t()?)?
            .broadcast_add(&self.bias_hh)?;

        let hs = self.hidden_size;
        let sigmoid = candle_nn::Activation::Sigmoid;

        match self.kind {
            RnnKind::Lstm => {
                let c = match c {
                    Some(c) => c,
                    None => candle_core::bail!("LSTM step без cell state"),
                };
                let gates = (x_gates + h_gates)?;
                let i_gate = sigmoid.forward(&gates.narrow(D::Minus1, 0, hs)?)?;
                let f_gate = sigmoid.forward(&gates.narrow(D::Minus1, hs, hs)?)?;
                let g_gate = gates.narrow(D::Minus1, 2 * hs, hs)?.tanh()?;
                let o_gate = sigmoid.forward(&gates.narrow(D::Minus1, 3 * hs, hs)?)?;

                let c_new = ((f_gate * c)? + (i_gate * g_gate)?)?;
                let h_new = (o_gate * c_new.tanh()?)?;
                Ok((h_new, Some(c_new)))
            }
            RnnKind::Gru => {
                let r_gate = sigmoid.forward(
                    &(x_gates.narrow(D::Minus1, 0, hs)? + h_gates.narrow(D::Minus1, 0, hs)?)?,
                )?;
                let z_gate = sigmoid.forward(
                    &(x_gates.narrow(D::Minus1, hs, hs)? + h_gates.narrow(D::Minus1, hs, hs)?)?,
                )?;
                let n_gate = (x_gates.narrow(D::Minus1, 2 * hs, hs)?
                    + (r_gate * h_gates.narrow(D::Minus1, 2 * hs, hs)?)?)?
                    .tanh()?;
                // h = n + z * (h_prev - n)
                let h_new = (&n_gate + (z_gate * (h - &n_gate)?)?)?;
                Ok((h_new, None))
            }
            RnnKind::Rnn => Ok(((x_gates + h_gates)?.tanh()?, None)),
        }
    }
}

/// Скрытое состояние рекуррентной сети.
///
/// Создаётся нулевым в начале каждого вызова decode и заменяется целиком
/// после каждого шага.
#[derive(Debug, Clone)]
pub struct RecurrentState {
    /// h[i]: [batch, hidden_size] для каждого слоя.
    pub h: Vec<Tensor>,
    /// c[i]: [batch, hidden_size] для каждого слоя (только LSTM, иначе пусто).
    pub c: Vec<Tensor>,
}

impl RecurrentState {
    /// Создать нулевое начальное состояние.
    pub fn zeros(
        kind: RnnKind,
        num_layers: usize,
        batch_size: usize,
        hidden_size: usize,
        dtype: DType,
        device: &Device,
    ) -> Result<Self> {
        let zeros = Tensor::zeros((batch_size, hidden_size), dtype, device)?;
        let h = vec![zeros.clone(); num_layers];
        let c = match kind {
            RnnKind::Lstm => vec![zeros; num_layers],
            RnnKind::Gru | RnnKind::Rnn => Vec::new(),
        };
        Ok(Self { h, c })
    }

    /// Количество слоёв.
    pub fn num_layers(&self) -> usize {
        self.h.len()
    }
}

/// Рекуррентный стек: N слоёв, dropout между слоями в режиме обучения.
#[derive(Debug, Clone)]
pub struct RecurrentLayer {
    kind: RnnKind,
    cells: Vec<RecurrentCell>,
    dropout: Dropout,
    hidden_size: usize,
}

impl RecurrentLayer {
    /// Загрузка весов.
    ///
    /// Ключи: `weight_ih_l{i}`, `weight_hh_l{i}`, `bias_ih_l{i}`, `bias_hh_l{i}`.
    pub fn load(
        kind: RnnKind,
        input_size: usize,
        hidden_size: usize,
        num_layers: usize,
        dropout_p: f32,
        vb: VarBuilder,
    ) -> Result<Self> {
        let mut cells = Vec::with_capacity(num_layers);
        for i in 0..num_layers {
            let layer_input = if i == 0 { input_size } else { hidden_size };
            cells.push(RecurrentCell::load(kind, layer_input, hidden_size, i, &vb)?);
        }
        Ok(Self {
            kind,
            cells,
            dropout: Dropout::new(dropout_p),
            hidden_size,
        })
    }

    /// Тип ячейки.
    pub fn kind(&self) -> RnnKind {
        self.kind
    }

    /// Размерность выхода.
    pub fn hidden_size(&self) -> usize {
        self.hidden_size
    }

    /// Нулевое состояние для батча.
    pub fn initial_state(&self, batch_size: usize, dtype: DType, device: &Device) -> Result<RecurrentState> {
        RecurrentState::zeros(
            self.kind,
            self.cells.len(),
            batch_size,
            self.hidden_size,
            dtype,
            device,
        )
    }

    /// Прогон последовательности.
    ///
    /// * `x`: [batch, seq_len, input_size]
    /// * `state`: состояние после предыдущего шага; `None` означает нулевое.
    ///
    /// Возвращает выход последнего слоя [batch, seq_len, hidden] и новое состояние.
    pub fn forward_t(
        &self,
        x: &Tensor,
        state: Option<&RecurrentState>,
        train: bool,
    ) -> Result<(Tensor, RecurrentState)> {
        let (batch_size, seq_len, _) = x.dims3()?;
        let initial;
        let state = match state {
            Some(s) => s,
            None => {
                initial = self.initial_state(batch_size, x.dtype(), x.device())?;
                &initial
            }
        };
        if state.num_layers() != self.cells.len() {
            candle_core::bail!(
                "RecurrentState: {} слоёв, ожидалось {}",
                state.num_layers(),
                self.cells.len()
            );
        }

        let mut layer_input = x.clone();
        let mut new_h = Vec::with_capacity(self.cells.len());
        let mut new_c = Vec::with_capacity(state.c.len());

        for (i, cell) in self.cells.iter().enumerate() {
            if i > 0 {
                layer_input = self.dropout.forward_t(&layer_input, train)?;
            }

            let mut h = state.h[i].clone();
            let mut c = state.c.get(i).cloned();
            let mut outputs = Vec::with_capacity(seq_len);

            for t in 0..seq_len {
                let x_t = layer_input.i((.., t, ..))?;
                let (h_next, c_next) = cell.step(&x_t, &h, c.as_ref())?;
                outputs.push(h_next.clone());
                h = h_next;
                c = c_next;
            }

            layer_input = Tensor::stack(&outputs, 1)?;
            new_h.push(h);
            if let Some(c) = c {
                new_c.push(c);
            }
        }

        Ok((layer_input, RecurrentState { h: new_h, c: new_c }))
    }
}
