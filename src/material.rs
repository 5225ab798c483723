//! Domain material description: map, diffusion coefficients and initial
//! temperature.
//!
//! Materials are either generated from the built-in cooler layout or read
//! from a raw little-endian file:
//!
//! ```text
//! EdgeSize            i64
//! CoolerTemp          f32
//! HeaterTemp          f32
//! DomainMap           i32[edge * edge]
//! DomainParameters    f32[edge * edge]
//! InitialTemperature  f32[edge * edge]
//! ```

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use crate::error::{DlbError, Result};

/// Physical properties of one medium.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Medium {
    /// Thermal conductivity [W/(m K)].
    pub conductivity: f32,
    /// Density [kg/m^3].
    pub density: f32,
    /// Specific heat capacity [J/(kg K)].
    pub heat_capacity: f32,
}

impl Medium {
    pub const AIR: Medium = Medium::new(0.0024, 1.207, 1006.1);
    pub const ALUMINUM: Medium = Medium::new(205.0, 2700.0, 910.0);
    pub const COPPER: Medium = Medium::new(387.0, 8940.0, 380.0);

    pub const fn new(conductivity: f32, density: f32, heat_capacity: f32) -> Self {
        Self {
            conductivity,
            density,
            heat_capacity,
        }
    }

    /// Thermal diffusivity `k / (rho * Cp)`.
    pub fn diffusivity(&self) -> f32 {
        self.conductivity / (self.density * self.heat_capacity)
    }

    /// Fourier number `alpha * dt / dx^2`.
    pub fn fourier(&self, dx: f32, dt: f32) -> f32 {
        self.diffusivity() * dt / (dx * dx)
    }
}

const MASK_SIZE: usize = 16;

/// 0 = air, 1 = aluminium fins, 2 = copper heat pipe. Row 0 is the heated
/// edge.
#[rustfmt::skip]
const COOLER_MASK: [i32; MASK_SIZE * MASK_SIZE] = [
    0, 0, 0, 0, 0, 2, 2, 2, 2, 2, 2, 0, 0, 0, 0, 0,
    0, 0, 0, 0, 0, 2, 2, 2, 2, 2, 2, 0, 0, 0, 0, 0,
    0, 0, 0, 0, 2, 2, 2, 2, 2, 2, 2, 2, 0, 0, 0, 0,
    0, 0, 0, 0, 1, 1, 2, 2, 2, 2, 1, 1, 0, 0, 0, 0,
    0, 0, 1, 1, 1, 1, 2, 2, 2, 2, 1, 1, 1, 1, 0, 0,
    0, 0, 0, 0, 0, 0, 2, 2, 2, 2, 0, 0, 0, 0, 0, 0,
    0, 0, 1, 1, 1, 1, 2, 2, 2, 2, 1, 1, 1, 1, 0, 0,
    0, 0, 0, 0, 0, 0, 2, 2, 2, 2, 0, 0, 0, 0, 0, 0,
    0, 0, 1, 1, 1, 1, 2, 2, 2, 2, 1, 1, 1, 1, 0, 0,
    0, 0, 0, 0, 0, 0, 2, 2, 2, 2, 0, 0, 0, 0, 0, 0,
    0, 0, 1, 1, 1, 1, 2, 2, 2, 2, 1, 1, 1, 1, 0, 0,
    0, 0, 0, 0, 0, 0, 2, 2, 2, 2, 0, 0, 0, 0, 0, 0,
    0, 0, 1, 1, 1, 1, 2, 2, 2, 2, 1, 1, 1, 1, 0, 0,
    0, 0, 0, 0, 0, 1, 1, 1, 1, 1, 1, 0, 0, 0, 0, 0,
    0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0,
    0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0,
];

/// Time step for a domain of `edge` points.
pub fn time_step(edge: usize) -> f32 {
    match edge {
        e if e < 128 => 0.1,
        e if e < 512 => 0.01,
        e if e < 2048 => 0.001,
        e if e < 16384 => 0.0001,
        _ => 0.00001,
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MaterialProperties {
    pub edge: usize,
    pub cooler_temp: f32,
    pub heater_temp: f32,
    pub map: Vec<i32>,
    pub params: Vec<f32>,
    pub initial_temp: Vec<f32>,
}

impl MaterialProperties {
    /// Scale the cooler layout to `edge` points (a power of two, at least
    /// 16) and derive coefficients and initial temperatures.
    pub fn generate(edge: usize, heater_temp: f32, cooler_temp: f32) -> Result<Self> {
        if !edge.is_power_of_two() || edge < MASK_SIZE {
            return Err(DlbError::Config(format!(
                "domain edge {edge} must be a power of two of at least {MASK_SIZE}"
            )));
        }
        let scale = edge / MASK_SIZE;
        let dx = 1.0 / edge as f32;
        let dt = time_step(edge);
        let coefficients = [
            Medium::AIR.fourier(dx, dt),
            Medium::ALUMINUM.fourier(dx, dt),
            Medium::COPPER.fourier(dx, dt),
        ];

        let mut map = vec![0i32; edge * edge];
        for (idx, cell) in map.iter_mut().enumerate() {
            let (y, x) = (idx / edge, idx % edge);
            *cell = COOLER_MASK[(y / scale) * MASK_SIZE + x / scale];
        }
        let params = map.iter().map(|&m| coefficients[m as usize]).collect();

        let mut initial_temp = vec![cooler_temp; edge * edge];
        for (temp, &material) in initial_temp.iter_mut().zip(&map).take(edge) {
            if material == 2 {
                *temp = heater_temp;
            }
        }

        tracing::debug!(edge, dx, dt, "generated material layout");
        Ok(Self {
            edge,
            cooler_temp,
            heater_temp,
            map,
            params,
            initial_temp,
        })
    }

    /// Uniform medium at a single temperature.
    pub fn uniform(edge: usize, material: i32, coefficient: f32, temp: f32) -> Self {
        Self {
            edge,
            cooler_temp: temp,
            heater_temp: temp,
            map: vec![material; edge * edge],
            params: vec![coefficient; edge * edge],
            initial_temp: vec![temp; edge * edge],
        }
    }

    pub fn area(&self) -> usize {
        self.edge * self.edge
    }

    pub fn read_from<R: Read>(reader: &mut R) -> Result<Self> {
        let mut scalar = [0u8; 8];
        reader.read_exact(&mut scalar)?;
        let edge = i64::from_le_bytes(scalar);
        if edge <= 0 {
            return Err(DlbError::Config(format!("invalid edge size {edge} in material file")));
        }
        let edge = edge as usize;
        let cooler_temp = read_f32(reader)?;
        let heater_temp = read_f32(reader)?;
        let area = edge * edge;

        let mut map = Vec::with_capacity(area);
        let mut word = [0u8; 4];
        for _ in 0..area {
            reader.read_exact(&mut word)?;
            map.push(i32::from_le_bytes(word));
        }
        let mut params = Vec::with_capacity(area);
        for _ in 0..area {
            params.push(read_f32(reader)?);
        }
        let mut initial_temp = Vec::with_capacity(area);
        for _ in 0..area {
            initial_temp.push(read_f32(reader)?);
        }

        Ok(Self {
            edge,
            cooler_temp,
            heater_temp,
            map,
            params,
            initial_temp,
        })
    }

    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_all(&(self.edge as i64).to_le_bytes())?;
        writer.write_all(&self.cooler_temp.to_le_bytes())?;
        writer.write_all(&self.heater_temp.to_le_bytes())?;
        for v in &self.map {
            writer.write_all(&v.to_le_bytes())?;
        }
        for v in self.params.iter().chain(&self.initial_temp) {
            writer.write_all(&v.to_le_bytes())?;
        }
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let mut reader = BufReader::new(File::open(path)?);
        Self::read_from(&mut reader)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let mut writer = BufWriter::new(File::create(path)?);
        self.write_to(&mut writer)?;
        writer.flush()?;
        Ok(())
    }
}

fn read_f32<R: Read>(reader: &mut R) -> Result<f32> {
    let mut word = [0u8; 4];
    reader.read_exact(&mut word)?;
    Ok(f32::from_le_bytes(word))
}
