use ndarray::Array2;
use std::f64::consts::PI;
use thiserror::Error;

/// A comprehensive error type for all operations within the basis module.
#[derive(Error, Debug)]
pub enum BasisError {
    #[error("At least one season per year is required to build a seasonal basis.")]
    ZeroSeasons,

    #[error("The calendar must have at least one day per year.")]
    ZeroDaysPerYear,

    #[error(
        "{seasons_per_year} seasons in a {days_per_year}-day year leave a season lengthscale of zero days."
    )]
    LengthscaleTooSmall {
        seasons_per_year: usize,
        days_per_year: usize,
    },

    #[error(
        "A calendar of {seasons_per_year} seasons in a {days_per_year}-day year overflows the day arithmetic."
    )]
    CalendarOverflow {
        seasons_per_year: usize,
        days_per_year: usize,
    },

    #[error("Cannot build a design matrix with zero time steps.")]
    Empty,
}

/// The centre and width assigned to each season of the year.
#[derive(Debug, Clone, PartialEq)]
pub struct SeasonLayout {
    /// Day of the year at which each season's basis function peaks.
    pub centres: Vec<f64>,
    /// Shared lengthscale (standard deviation, in days) of every season.
    pub lengthscale: f64,
}

/// Places the seasons evenly around the year.
///
/// Centres sit at `s * days_per_year / seasons_per_year` and every season shares
/// the lengthscale `days_per_year / (2 * seasons_per_year)`. Both use integer
/// division so that the calendar lands on whole days.
pub fn season_layout(
    seasons_per_year: usize,
    days_per_year: usize,
) -> Result<SeasonLayout, BasisError> {
    if seasons_per_year == 0 {
        return Err(BasisError::ZeroSeasons);
    }
    if days_per_year == 0 {
        return Err(BasisError::ZeroDaysPerYear);
    }

    // Every centre numerator `s * days_per_year` is below this product.
    let overflow = || BasisError::CalendarOverflow {
        seasons_per_year,
        days_per_year,
    };
    let double_seasons = seasons_per_year.checked_mul(2).ok_or_else(overflow)?;
    seasons_per_year
        .checked_mul(days_per_year)
        .ok_or_else(overflow)?;

    let lengthscale = days_per_year / double_seasons;
    if lengthscale == 0 {
        return Err(BasisError::LengthscaleTooSmall {
            seasons_per_year,
            days_per_year,
        });
    }

    let centres = (0..seasons_per_year)
        .map(|s| (s * days_per_year / seasons_per_year) as f64)
        .collect();

    Ok(SeasonLayout {
        centres,
        lengthscale: lengthscale as f64,
    })
}

/// Evaluates a normalised Gaussian radial basis function on a circular year.
///
/// The distance from time step `n` to `centre` is measured along the circle:
/// the day of year is compared against the centre in the previous, current and
/// next year and the shortest distance wins.
pub fn evaluate_radial_basis_function(
    n: usize,
    centre: f64,
    lengthscale: f64,
    days_per_year: usize,
) -> f64 {
    let day_of_this_year = (n % days_per_year) as f64;
    let year = days_per_year as f64;

    let days_to_centre = [day_of_this_year + year, day_of_this_year, day_of_this_year - year]
        .into_iter()
        .map(|day| (day - centre).abs())
        .fold(f64::INFINITY, f64::min);

    let quadratic = -days_to_centre * days_to_centre / (2.0 * lengthscale * lengthscale);
    let normalisation = lengthscale * (2.0 * PI).sqrt();
    quadratic.exp() / normalisation
}

/// Builds the seasonal design matrix.
///
/// # Arguments
///
/// * `num_time_steps`: Number of rows `N`, one per day.
/// * `seasons_per_year`: Number of periodic Gaussian basis functions.
/// * `days_per_year`: Length of the circular year.
/// * `include_bias`: Appends a constant column of ones as the last column.
///
/// # Returns
///
/// An `N x M` matrix with `M = seasons_per_year + include_bias as usize`.
pub fn generate_basis_functions(
    num_time_steps: usize,
    seasons_per_year: usize,
    days_per_year: usize,
    include_bias: bool,
) -> Result<Array2<f64>, BasisError> {
    if num_time_steps == 0 {
        return Err(BasisError::Empty);
    }
    let layout = season_layout(seasons_per_year, days_per_year)?;
    let num_basis = seasons_per_year + usize::from(include_bias);

    let mut x = Array2::zeros((num_time_steps, num_basis));
    for (n, mut row) in x.rows_mut().into_iter().enumerate() {
        for (s, &centre) in layout.centres.iter().enumerate() {
            row[s] =
                evaluate_radial_basis_function(n, centre, layout.lengthscale, days_per_year);
        }
        if include_bias {
            row[num_basis - 1] = 1.0;
        }
    }

    log::debug!(
        "Generated seasonal basis: {} time steps x {} basis functions (lengthscale {} days)",
        num_time_steps,
        num_basis,
        layout.lengthscale
    );

    Ok(x)
}
