//! Utilidades de tiempo para la capa de comandos: interpretar posiciones
//! escritas por usuarios y formatear duraciones para mostrar.

use std::time::Duration;

use crate::error::MusicError;

/// Interpreta una posición como "1:30", "90", "90s" o "1m30s".
pub fn parse_position(input: &str) -> Result<Duration, MusicError> {
    let input = input.trim();
    if input.is_empty() {
        return Err(MusicError::user("posición vacía"));
    }

    // Formato mm:ss
    if let Some((minutes, seconds)) = input.split_once(':') {
        let minutes: u64 = minutes
            .parse()
            .map_err(|_| MusicError::user("formato de posición inválido"))?;
        let seconds: u64 = seconds
            .parse()
            .map_err(|_| MusicError::user("formato de posición inválido"))?;
        if seconds >= 60 {
            return Err(MusicError::user("los segundos deben ser menores que 60"));
        }
        return Ok(Duration::from_secs(minutes * 60 + seconds));
    }

    // Formato con unidades: "1m30s", "45s"
    if input.ends_with('s') || input.ends_with('m') || input.ends_with('h') {
        return parse_with_units(input);
    }

    // Segundos a secas
    input
        .parse::<u64>()
        .map(Duration::from_secs)
        .map_err(|_| MusicError::user("formato de posición inválido"))
}

fn parse_with_units(input: &str) -> Result<Duration, MusicError> {
    let mut total = 0u64;
    let mut number = String::new();

    for ch in input.chars() {
        if ch.is_ascii_digit() {
            number.push(ch);
            continue;
        }
        let value: u64 = number
            .parse()
            .map_err(|_| MusicError::user("formato de posición inválido"))?;
        number.clear();
        total += match ch {
            'h' => value * 3600,
            'm' => value * 60,
            's' => value,
            _ => return Err(MusicError::user("formato de posición inválido")),
        };
    }

    if !number.is_empty() {
        return Err(MusicError::user("formato de posición inválido"));
    }
    Ok(Duration::from_secs(total))
}

/// Formatea una duración como "mm:ss", o "hh:mm:ss" a partir de la hora.
pub fn format_duration(duration: Duration) -> String {
    let total = duration.as_secs();
    let hours = total / 3600;
    let minutes = (total % 3600) / 60;
    let seconds = total % 60;

    if hours > 0 {
        format!("{hours:02}:{minutes:02}:{seconds:02}")
    } else {
        format!("{minutes:02}:{seconds:02}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interpreta_los_formatos_de_posicion() {
        assert_eq!(parse_position("1:30").unwrap(), Duration::from_secs(90));
        assert_eq!(parse_position("90").unwrap(), Duration::from_secs(90));
        assert_eq!(parse_position("90s").unwrap(), Duration::from_secs(90));
        assert_eq!(parse_position("1m30s").unwrap(), Duration::from_secs(90));
        assert_eq!(parse_position("1h2m3s").unwrap(), Duration::from_secs(3723));
        assert_eq!(parse_position("0").unwrap(), Duration::ZERO);
    }

    #[test]
    fn rechaza_posiciones_invalidas() {
        assert!(parse_position("").is_err());
        assert!(parse_position("1:75").is_err());
        assert!(parse_position("abc").is_err());
        assert!(parse_position("1m30").is_err());
        assert!(parse_position("-5").is_err());
    }

    #[test]
    fn formatea_con_y_sin_horas() {
        assert_eq!(format_duration(Duration::from_secs(90)), "01:30");
        assert_eq!(format_duration(Duration::from_secs(3723)), "01:02:03");
        assert_eq!(format_duration(Duration::ZERO), "00:00");
    }
}
