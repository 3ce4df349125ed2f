use std::io::{self, Write};

use anyhow::{bail, Context, Result};
use chrono::NaiveDate;

use hullzero_core::forms::{LoginForm, RegisterForm};
use hullzero_core::utils::{format_expiry, format_optional, format_roles, mask_secret};
use hullzero_core::{LoginOptions, LoginRequest, PasswordChange, SessionManager, User};

fn prompt(label: &str) -> Result<String> {
    print!("{}", label);
    io::stdout().flush()?;
    let mut line = String::new();
    io::stdin()
        .read_line(&mut line)
        .context("Failed to read from stdin")?;
    Ok(line.trim().to_string())
}

fn print_user(user: &User) {
    println!("{} <{}>", user.display_name(), user.email);
    println!("  id:         {}", user.id);
    println!("  username:   {}", user.username);
    println!("  roles:      {}", format_roles(&user.roles));
    println!(
        "  status:     {}{}",
        if user.is_active { "active" } else { "inactive" },
        if user.is_verified { ", verified" } else { "" }
    );
    if let Some(line) = user.job_line() {
        println!("  position:   {}", line);
    }
    println!("  employee:   {}", format_optional(&user.employee_id, "-"));
}

pub async fn login(
    manager: &SessionManager,
    email: Option<String>,
    remember: bool,
    validate: bool,
) -> Result<()> {
    let email = match email.or(manager.remembered_email().await) {
        Some(e) if !e.trim().is_empty() => e,
        _ => prompt("Email: ")?,
    };
    let password = rpassword::prompt_password("Password: ")?;

    let result = if validate {
        let form = LoginForm::new(email, password).remember_me(remember);
        manager.submit_login(&form).await
    } else {
        manager
            .login(
                &LoginRequest::new(email, password),
                LoginOptions {
                    remember_me: remember,
                },
            )
            .await
    };

    let user = result?;
    print_user(&user);
    Ok(())
}

pub async fn register(manager: &SessionManager, email: String, remember: bool) -> Result<()> {
    let full_name = prompt("Full name: ")?;
    let nickname = prompt("Nickname: ")?;
    let cpf = prompt("CPF (###.###.###-##): ")?;
    let birth_date = prompt("Birth date (YYYY-MM-DD): ")?;
    let area_code = prompt("Area code: ")?;
    let phone_number = prompt("Phone number: ")?;
    let postal_code = prompt("Postal code (#####-###): ")?;
    let line_address = prompt("Address: ")?;
    let password = rpassword::prompt_password("Password: ")?;
    let confirmed_password = rpassword::prompt_password("Confirm password: ")?;
    let accepted_terms = prompt("Accept the terms of use? [y/N]: ")?.eq_ignore_ascii_case("y");

    let form = RegisterForm {
        postal_code,
        line_address,
        country_code: None,
        area_code,
        phone_number,
        email,
        password,
        confirmed_password,
        full_name,
        cpf,
        nickname,
        // An unparseable date is reported by the form validator
        birth_date: NaiveDate::parse_from_str(&birth_date, "%Y-%m-%d").ok(),
        accepted_terms,
        remember_me: remember,
    };

    let user = manager.submit_register(&form).await?;
    print_user(&user);
    Ok(())
}

pub async fn logout(manager: &SessionManager) -> Result<()> {
    manager.logout().await;
    println!("Logged out");
    Ok(())
}

pub async fn whoami(manager: &SessionManager, json: bool) -> Result<()> {
    if !manager.is_authenticated().await {
        bail!("Not logged in");
    }
    let Some(user) = manager.get_current_user().await else {
        bail!("Session ended - please log in again");
    };
    if json {
        println!("{}", serde_json::to_string_pretty(&user)?);
    } else {
        print_user(&user);
    }
    Ok(())
}

pub async fn status(manager: &SessionManager) -> Result<()> {
    let session = manager.snapshot().await;
    println!("state:            {}", session.state());
    println!(
        "access token:     {}",
        session
            .access_token
            .as_deref()
            .map(mask_secret)
            .unwrap_or_else(|| "-".to_string())
    );
    println!("expires in:       {}", format_expiry(session.minutes_until_expiry()));
    println!("remember me:      {}", session.remember_me);
    println!(
        "remembered email: {}",
        format_optional(&session.remembered_email, "-")
    );
    if let Some(ref user) = session.user {
        println!("user:             {} ({})", user.display_name(), format_roles(&user.roles));
    }
    Ok(())
}

pub async fn has_role(manager: &SessionManager, roles: &[String]) -> Result<()> {
    if manager.has_any_role(roles).await {
        println!("yes");
        Ok(())
    } else {
        bail!("User has none of: {}", roles.join(", "))
    }
}

pub async fn change_password(manager: &SessionManager) -> Result<()> {
    if !manager.is_authenticated().await {
        bail!("Not logged in");
    }
    let current_password = rpassword::prompt_password("Current password: ")?;
    let new_password = rpassword::prompt_password("New password: ")?;
    let confirmation = rpassword::prompt_password("Confirm new password: ")?;
    if new_password != confirmation {
        bail!("Passwords do not match");
    }

    manager
        .change_password(&PasswordChange {
            current_password,
            new_password,
        })
        .await?;
    Ok(())
}
